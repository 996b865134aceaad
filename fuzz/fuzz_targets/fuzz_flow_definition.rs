#![no_main]

use libfuzzer_sys::fuzz_target;

use wacrm::flows::{parse_flows, FlowCatalog};

fuzz_target!(|data: &str| {
    // Arbitrary JSON5 either loads or yields definition errors.
    if let Ok(definitions) = parse_flows(data, "fuzz") {
        let _ = FlowCatalog::from_definitions(definitions);
    }
});
