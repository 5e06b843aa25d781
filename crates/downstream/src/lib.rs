pub mod forward;

pub use forward::{ForwardClient, ForwardError, ForwardRequest, ATTEMPT_HEADER, EVENT_ID_HEADER};
