#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: credflow_sdk::definitions::fuzzing::Wrapper| {
    let params = data.0;

    if let Ok(phase) = params.phase() {
        let message = params.to_message(phase);
        assert_eq!(message["flow"], "issuance");
        assert!(message.get("flowId").is_none());
    }
});
