//! mailbridge: local broker between a job-producing application and a
//! sandboxed mail-client extension.
//!
//! Producers drop job files into a queue directory; the host, launched by the
//! mail client as a native messaging host, forwards them over framed stdio
//! and records the extension's results next to them.

mod version;

pub mod bridge;
pub mod channel;
pub mod config;
pub mod file_proxy;
pub mod host;
pub mod job;
pub mod manifest;
pub mod producer;
pub mod queue;
pub mod singleton;

pub use bridge::codec::{CodecError, FrameCodec, FrameReader, MAX_FRAME_LEN};
pub use bridge::protocol::{Frame, Inbound, Outbound};
pub use channel::{ChannelError, ExtensionChannel};
pub use config::{ChannelConfig, HostConfig};
pub use host::{BridgeHost, ConnectionState, HostError};
pub use job::{AttachmentRef, EmailPayload, JobDescriptor, JobId, JobResult};
pub use producer::{JobProducer, ProducerError};
pub use queue::{JobStore, StoreError};
pub use singleton::{LockError, ProcessLock};
pub use version::{MAILBRIDGE_VERSION, PROTOCOL_VERSION, VersionInfo};
