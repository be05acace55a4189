//! muster-agent — the fleet peer that dials a broker, joins, and serves
//! the broker's calls over one multiplexed session.

pub mod backoff;
pub mod dialer;

pub use backoff::backoff_for;
pub use dialer::{AgentSession, DialError, Dialer};
