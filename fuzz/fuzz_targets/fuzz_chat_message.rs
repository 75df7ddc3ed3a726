#![no_main]

use libfuzzer_sys::fuzz_target;
use wamschat_client::ChatMessage;

fuzz_target!(|data: &[u8]| {
    // Delivery bodies come straight off the stream; decoding must never panic.
    let Ok(message) = ChatMessage::decode(data) else {
        return;
    };

    // Anything that decodes must survive a re-encode and decode to itself.
    let body = message.encode().expect("decoded envelope must encode");
    let again = ChatMessage::decode(&body).expect("encoded envelope must decode");
    assert_eq!(message, again);
});
