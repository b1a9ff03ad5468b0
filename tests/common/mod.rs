#![allow(dead_code)]

use labrinth_rest::{
    MemorySink, RequestData, Rest, RestEvent, RestOptions, ScriptedTransport, TrackingSleeper,
};

/// A client wired to a scripted transport, a recording sleeper, and an in-memory sink.
pub struct Harness {
    pub rest: Rest,
    pub transport: ScriptedTransport,
    pub sleeper: TrackingSleeper,
    pub events: MemorySink,
}

pub fn harness(options: RestOptions) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = ScriptedTransport::new();
    let sleeper = TrackingSleeper::new();
    let events = MemorySink::new();
    let rest = Rest::builder()
        .options(options)
        .transport(transport.clone())
        .sleeper(sleeper.clone())
        .sink(events.clone())
        .build()
        .expect("valid options");
    Harness { rest, transport, sleeper, events }
}

/// Request data for routes that need no token.
pub fn public() -> RequestData {
    RequestData::new().auth(false)
}

pub fn debug_lines(events: &MemorySink) -> Vec<String> {
    events
        .events()
        .into_iter()
        .filter_map(|event| match event {
            RestEvent::Debug(line) => Some(line),
            _ => None,
        })
        .collect()
}
