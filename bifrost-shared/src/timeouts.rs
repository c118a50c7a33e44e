//! Timeout, backoff, and threshold constants shared by the server and the
//! agent. Collected in one place (the teacher's own pattern) so the
//! relationships between them — e.g. a client timeout must exceed the
//! resolver budget it is waiting behind — stay visible and testable.

use std::time::Duration;

/// How long an `ApiKeyResolver::resolve` call is expected to take at the
/// outside. A resolver backed by a slow external service should honor this
/// budget internally; the server does not enforce it, but `NETWORK_TIMEOUT`
/// below is sized to tolerate it.
pub const RESOLVER_TIMEOUT: Duration = Duration::from_secs(5);

/// How long either side of the control connection waits for an expected
/// reply (e.g. the agent waiting for `registered`/`unauthorized`) before
/// giving up. Must exceed `RESOLVER_TIMEOUT`, since a `register` round trip
/// may block behind a resolver call.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff between backend agent reconnect attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Per-attempt timeout for the agent's dial to its local target.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Number of dial attempts the agent makes before giving up and reporting
/// `error` back to the server.
pub const DIAL_RETRIES: u32 = 3;

/// Backoff between dial attempts.
pub const DIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Deadline for a `Pending` request session to receive `connect` from the
/// agent before the server abortively closes it. Also used as the agent's
/// own per-attempt dial timeout, so a single dial attempt has time to land
/// before the server gives up waiting.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How often the server sweeps `Pending` request sessions for
/// `CONNECT_TIMEOUT` expiry, and the agent sweeps its packet queues.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Age past which a queued pre-connect packet on the agent side is dropped
/// rather than delivered.
pub const PACKET_TTL: Duration = Duration::from_secs(60);

/// Maximum number of packets buffered per agent-side dialer session while
/// waiting for the local dial to complete.
pub const PACKET_QUEUE_CAP: usize = 1000;
