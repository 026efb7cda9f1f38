#![no_main]

use libfuzzer_sys::fuzz_target;
use mushaf::protocol::decode_command;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Unknown or malformed messages are ignored, never a panic.
    let Some(command) = decode_command(text) else {
        return;
    };

    // A decoded command survives re-encoding unchanged.
    let encoded = serde_json::to_string(&command).unwrap();
    assert_eq!(decode_command(&encoded), Some(command), "{encoded}");
});
