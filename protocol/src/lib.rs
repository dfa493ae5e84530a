//! Wire-visible data model for a trellis node.
//!
//! Everything a frontend or the control plane can observe lives here:
//! the framed command/notification protocol spoken over the local
//! socket, user preferences, host info, network maps, and status
//! snapshots. The agent itself lives in `trellis-core`; this crate is
//! deliberately free of behavior beyond serialization and framing.

pub mod codec;
pub mod command;
pub mod hostinfo;
pub mod key;
pub mod netmap;
pub mod notify;
pub mod prefs;
pub mod state;
pub mod status;
pub mod version;

pub use codec::ProtocolError;
pub use command::Command;
pub use command::CommandOp;
pub use command::OauthToken;
pub use command::StartOptions;
pub use hostinfo::Hostinfo;
pub use hostinfo::NetInfo;
pub use hostinfo::Service;
pub use hostinfo::ServiceProto;
pub use key::DiscoKey;
pub use key::MachineKey;
pub use key::NodeKey;
pub use netmap::DerpMap;
pub use netmap::DnsBlock;
pub use netmap::FilterRule;
pub use netmap::MachineStatus;
pub use netmap::NetworkMap;
pub use netmap::Peer;
pub use notify::LoginFinished;
pub use notify::Notify;
pub use prefs::NetfilterMode;
pub use prefs::Persist;
pub use prefs::Prefs;
pub use state::LifecycleState;
pub use status::EngineStatus;
pub use status::PeerStatus;
pub use status::PingResult;
pub use status::Status;
pub use status::StatusBuilder;
