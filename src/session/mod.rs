pub mod peer;
pub mod registry;
pub mod stream;

pub use peer::{IceCandidate, OutboundSignal, PeerController, PeerState, SessionEvent, Signal};
pub use registry::{Session, SessionRegistry, SessionSnapshot};
pub use stream::StreamController;
