pub mod middleware;
pub mod routes;
pub mod signaling;

pub use middleware::log_request_errors;
pub use routes::{debug_session, debug_sessions, liveness, start_stream, stop_stream};
pub use signaling::signaling;
