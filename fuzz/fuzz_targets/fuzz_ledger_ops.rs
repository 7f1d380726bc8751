#![no_main]

use std::collections::HashMap;
use std::sync::Arc;

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use nnn_mint_core::{
    AllocationError, Allocator, ClaimantAddress, LedgerError, LedgerOptions, RetryPolicy,
    SettlementReference, SupplyLedger,
};

#[derive(Debug, Arbitrary)]
enum Op {
    Claim {
        who: u8,
        upper: bool,
        fid: Option<u32>,
    },
    Settle { who: u8, hash_byte: u8 },
    Reopen,
}

#[derive(Debug, Arbitrary)]
struct Input {
    cap_raw: u8,
    ops: Vec<Op>,
}

fn claimant(who: u8, upper: bool) -> ClaimantAddress {
    let hex = format!("{:040x}", u64::from(who) * 0xabcdef);
    let raw = if upper {
        format!("0X{}", hex.to_ascii_uppercase())
    } else {
        format!("0x{hex}")
    };
    ClaimantAddress::parse(&raw).expect("generated address is well formed")
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let Ok(input) = Input::arbitrary(&mut u) else {
        return;
    };
    let cap = u32::from(input.cap_raw % 8) + 1;
    let temp = tempfile::TempDir::new().expect("temp dir");
    let path = temp.path().join("fuzz.sqlite");
    let open = || {
        let ledger = SupplyLedger::open(&path, LedgerOptions::with_supply_cap(cap)).expect("open");
        Allocator::new(Arc::new(ledger), RetryPolicy::no_retry())
    };
    let mut alloc = open();

    // who -> (slot, settlement byte)
    let mut model: HashMap<u8, (u32, Option<u8>)> = HashMap::new();
    for op in input.ops.into_iter().take(64) {
        match op {
            Op::Claim { who, upper, fid } => {
                let result = alloc.allocate(&claimant(who, upper), fid.map(u64::from));
                match (model.get(&who), result) {
                    (Some(_), Err(AllocationError::AlreadyClaimed)) => {}
                    (None, Ok(record)) => {
                        assert_eq!(record.slot_number as usize, model.len() + 1);
                        model.insert(who, (record.slot_number, None));
                    }
                    (None, Err(AllocationError::SupplyExhausted { .. })) => {
                        assert_eq!(model.len() as u32, cap);
                    }
                    (expected, other) => panic!("model {expected:?} vs ledger {other:?}"),
                }
            }
            Op::Settle { who, hash_byte } => {
                let hex = format!("{hash_byte:02x}").repeat(32);
                let reference = SettlementReference::parse(&format!("0x{hex}"))
                    .expect("generated hash is well formed");
                let result = alloc
                    .ledger()
                    .attach_settlement_reference(&claimant(who, false), &reference);
                match (model.get_mut(&who), result) {
                    (None, Err(LedgerError::ClaimNotFound { .. })) => {}
                    (Some((_, settled @ None)), Ok(_)) => *settled = Some(hash_byte),
                    (Some((_, Some(prev))), Ok(_)) => assert_eq!(*prev, hash_byte),
                    (Some((_, Some(prev))), Err(LedgerError::SettlementConflict { .. })) => {
                        assert_ne!(*prev, hash_byte)
                    }
                    (expected, other) => panic!("model {expected:?} vs ledger {other:?}"),
                }
            }
            Op::Reopen => {
                drop(alloc);
                alloc = open();
            }
        }
        assert_eq!(
            alloc.ledger().verify_integrity().expect("integrity") as usize,
            model.len()
        );
    }
});
