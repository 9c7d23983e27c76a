//! The seam between the core and the process embedding it.
//!
//! The core performs no I/O of its own: sends, timers, clocks, entropy, and
//! blob storage all go through a [`Host`]. Entry points borrow the host for
//! the duration of the call, which also makes synchronous re-entry into the
//! same session impossible: a callback cannot call back into the core it
//! was invoked from.

use bitflags::bitflags;

use crate::{
    addr::{PeerAddr, TransportKind},
    relay::{RelayPhase, RelayReason},
    ty::RelayHostId,
};

bitflags! {
    /// Capability bits of the host's transport layer.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TransportFlags: u32 {
        /// The host can deliver relay traffic by store-and-forward without a
        /// live relay connection ([`Host::send_no_conn`]).
        const HAS_NOCONN = 1 << 0;
        /// The host joins relay rooms over its own request/response channel
        /// ([`Host::request_join`]) instead of the socket conversation.
        const JOIN_VIA_REQUEST = 1 << 1;
    }
}

/// The core's time-driven activities; each maps to one host timer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Retry undelivered queue elements.
    Resend,
    /// Re-attempt the relay connection, fixed 15 s cadence.
    RelayReconnect,
}

/// Everything the core asks of its embedder.
///
/// All methods are synchronous; they may block, but the core assumes nothing
/// beyond "they return". Only [`Host::send`], [`Host::role_change`],
/// [`Host::now_secs`] and [`Host::random_seed`] lack defaults.
pub trait Host {
    /// Hands `frame` to the transport driver for `kind`, addressed by `addr`.
    ///
    /// `msg_no` is a diagnostic tag (`hostid:seq`). Returns the number of
    /// bytes accepted, negative on failure.
    fn send(
        &mut self,
        frame: &[u8],
        msg_no: &str,
        addr: &PeerAddr,
        kind: TransportKind,
        game_id: u32,
    ) -> i32;

    /// Store-and-forward send of a relay message while no relay connection is
    /// live. Returns whether the bytes were accepted.
    fn send_no_conn(&mut self, _frame: &[u8], _msg_no: &str, _relay_id: &str) -> bool {
        false
    }

    /// Capability bits of the transport layer.
    fn transport_flags(&self) -> TransportFlags {
        TransportFlags::empty()
    }

    /// The number of pending outbound messages changed. Informational.
    fn count_changed(&mut self, _pending: usize) {}

    /// The relay conversation moved to a new phase. Observer only.
    fn relay_status(&mut self, _phase: RelayPhase) {}

    /// Fires on entry to the connected phases: once when the relay accepts
    /// the connection (with the count of players still missing), and again
    /// with `all_here` when the whole game is present.
    fn relay_connected(
        &mut self,
        _room: &str,
        _reconnected: bool,
        _host_id: RelayHostId,
        _all_here: bool,
        _players_missing: u8,
    ) {
    }

    /// A relay Status or Denied frame carried a reason that needs user
    /// action.
    fn relay_error(&mut self, _reason: RelayReason) {}

    /// The relay's connect response assigned this session the opposite role
    /// from the one it assumed. By the time this fires the channel table and
    /// queue have been reset. Must not attempt a send from inside the
    /// callback.
    fn role_change(&mut self, new_is_server: bool);

    /// Alternate relay join path over a request/response channel, used
    /// instead of the socket conversation when the host offers one.
    fn request_join(
        &mut self,
        _dev_id: &str,
        _room: &str,
        _players_here: u8,
        _players_total: u8,
        _seed: u16,
        _lang: u8,
    ) {
    }

    /// Asks to be called back via the session's `timer_fired` in `secs`
    /// seconds. A later call for the same kind replaces the earlier one.
    fn set_timer(&mut self, _kind: TimerKind, _secs: u16) {}

    /// Cancels a pending timer.
    fn clear_timer(&mut self, _kind: TimerKind) {}

    /// Current wall-clock time in seconds. Only differences matter, but the
    /// value is persisted, so it must survive a process restart (i.e. not be
    /// a process-relative monotonic clock).
    fn now_secs(&self) -> u32;

    /// Entropy for the session's channel seed.
    fn random_seed(&mut self) -> u16;

    /// Whether two phone numbers name the same subscriber. The host owns
    /// normalisation (country codes, spacing); the default is exact
    /// equality.
    fn phones_same(&self, a: &str, b: &str) -> bool {
        a == b
    }

    /// Loads an opaque blob previously stored under `key`.
    fn load_blob(&mut self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    /// Durably stores an opaque blob under `key`.
    fn store_blob(&mut self, _key: &str, _bytes: &[u8]) {}
}
