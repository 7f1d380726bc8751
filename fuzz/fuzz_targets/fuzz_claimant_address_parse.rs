#![no_main]

use libfuzzer_sys::fuzz_target;
use nnn_mint_core::{AddressError, ClaimantAddress, SettlementReference};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    match ClaimantAddress::parse(raw) {
        Ok(addr) => {
            let s = addr.as_str();
            assert_eq!(s.len(), 42);
            assert!(s.starts_with("0x"));
            assert_eq!(s, s.to_ascii_lowercase());
            assert!(raw.eq_ignore_ascii_case(s));
            // Normalization is a fixed point.
            assert_eq!(ClaimantAddress::parse(s).ok().as_ref(), Some(&addr));
        }
        Err(AddressError::Missing) => assert!(raw.is_empty()),
        Err(AddressError::Malformed) => assert!(!raw.is_empty()),
    }

    if let Ok(reference) = SettlementReference::parse(raw) {
        assert_eq!(reference.as_str().len(), 66);
    }
});
