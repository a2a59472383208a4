#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    match credflow_sdk::definitions::InboundMessage::parse(text) {
        Ok(message) => {
            // interpreting a decoded message must never panic
            let _ = message.progress_event();
            if message.is_error() {
                let _ = message.flow_error();
            }
        }
        Err(_) => {
            // ignore errors. We're really looking for panics with this fuzzer
        }
    }
});
