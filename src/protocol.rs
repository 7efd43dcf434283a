//! The cross-process control plane between the viewer and the injected
//! agent: window-message identifiers, the wire form of the screen
//! rectangle, and the viewer's handshake state machine.
//!
//! Small messages travel as plain window messages (`WM_APP + n`);
//! anything larger goes through `WM_COPYDATA` with `dwData`
//! discriminating the payload kind.

use crate::monitor::MonitorRect;

const WM_APP: u32 = 0x8000;

/// viewer -> agent: the viewer is alive; refresh the agent's watchdog.
pub const WM_APP_KEEPALIVE: u32 = WM_APP + 2;

/// viewer -> agent: LPARAM carries the shared-texture handle to adopt
/// as the new capture target.
pub const WM_APP_NEWTEXTURE: u32 = WM_APP + 3;

/// agent -> viewer: injection succeeded; LPARAM carries the agent's
/// message-window handle.
pub const WM_APP_INJECTED: u32 = WM_APP + 4;

/// `WM_COPYDATA` payload: a UTF-8 log line, not necessarily
/// NUL-terminated.
pub const COPYDATA_LOG: usize = 1;

/// `WM_COPYDATA` payload: the monitor rectangle as four little-endian
/// `i32`s (left, top, right, bottom).
pub const COPYDATA_NEWSCREEN: usize = 2;

/// Byte length of the NEWSCREEN payload.
pub const NEWSCREEN_PAYLOAD_LEN: usize = 16;

pub fn encode_screen_rect(rect: MonitorRect) -> [u8; NEWSCREEN_PAYLOAD_LEN] {
    let mut bytes = [0u8; NEWSCREEN_PAYLOAD_LEN];
    bytes[0..4].copy_from_slice(&rect.left.to_le_bytes());
    bytes[4..8].copy_from_slice(&rect.top.to_le_bytes());
    bytes[8..12].copy_from_slice(&rect.right.to_le_bytes());
    bytes[12..16].copy_from_slice(&rect.bottom.to_le_bytes());
    bytes
}

pub fn decode_screen_rect(payload: &[u8]) -> Option<MonitorRect> {
    if payload.len() != NEWSCREEN_PAYLOAD_LEN {
        return None;
    }
    let field = |i: usize| i32::from_le_bytes(payload[i * 4..i * 4 + 4].try_into().unwrap());
    Some(MonitorRect {
        left: field(0),
        top: field(1),
        right: field(2),
        bottom: field(3),
    })
}

/// The viewer's view of the agent link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// The compositor is not running (or was never seen).
    Disconnected,
    /// The agent DLL has been (or is being) loaded into the compositor;
    /// no handshake yet.
    Injecting,
    /// Handshake complete; the agent's message window is known.
    Connected,
    /// The link went quiet; re-injection happens on the next tick.
    Stale,
}

/// What the keep-alive tick should do after a state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    None,
    /// Load the agent into the compositor and call its entry point.
    Inject,
    /// Post a keep-alive to the agent's message window.
    SendKeepalive,
}

impl LinkState {
    /// Advances the state on the 1-second keep-alive tick, given what
    /// the process/module snapshots say about the compositor.
    pub fn on_tick(self, compositor_running: bool, agent_loaded: bool) -> (LinkState, TickAction) {
        if !compositor_running {
            return (LinkState::Disconnected, TickAction::None);
        }
        if !agent_loaded {
            return (LinkState::Injecting, TickAction::Inject);
        }
        match self {
            LinkState::Connected => (LinkState::Connected, TickAction::SendKeepalive),
            // The DLL is resident but we have no (fresh) handshake.
            // Keep nudging; the agent either answers with INJECTED or
            // watchdogs out, after which the missing-module branch
            // re-injects.
            LinkState::Stale => (LinkState::Injecting, TickAction::SendKeepalive),
            LinkState::Disconnected | LinkState::Injecting => {
                (LinkState::Injecting, TickAction::None)
            }
        }
    }

    /// The agent announced itself.
    pub fn on_injected(self) -> LinkState {
        LinkState::Connected
    }

    /// Nothing has been heard from the agent for longer than the
    /// keep-alive window.
    pub fn on_silence(self) -> LinkState {
        match self {
            LinkState::Connected => LinkState::Stale,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_rect_codec_round_trips() {
        let rect = MonitorRect {
            left: -1920,
            top: 0,
            right: 0,
            bottom: 1200,
        };
        let bytes = encode_screen_rect(rect);
        assert_eq!(decode_screen_rect(&bytes), Some(rect));
    }

    #[test]
    fn screen_rect_decode_rejects_wrong_lengths() {
        assert_eq!(decode_screen_rect(&[0u8; 15]), None);
        assert_eq!(decode_screen_rect(&[0u8; 17]), None);
        assert_eq!(decode_screen_rect(&[]), None);
    }

    #[test]
    fn message_ids_match_the_wire_protocol() {
        assert_eq!(WM_APP_KEEPALIVE, 0x8002);
        assert_eq!(WM_APP_NEWTEXTURE, 0x8003);
        assert_eq!(WM_APP_INJECTED, 0x8004);
    }

    #[test]
    fn handshake_walks_disconnected_to_connected() {
        let state = LinkState::Disconnected;

        // Compositor running, agent absent: inject.
        let (state, action) = state.on_tick(true, false);
        assert_eq!(state, LinkState::Injecting);
        assert_eq!(action, TickAction::Inject);

        // Agent loaded but no handshake yet: wait.
        let (state, action) = state.on_tick(true, true);
        assert_eq!(state, LinkState::Injecting);
        assert_eq!(action, TickAction::None);

        // INJECTED arrives.
        let state = state.on_injected();
        assert_eq!(state, LinkState::Connected);

        // Steady state: keep-alives flow.
        let (state, action) = state.on_tick(true, true);
        assert_eq!(state, LinkState::Connected);
        assert_eq!(action, TickAction::SendKeepalive);
    }

    #[test]
    fn silence_marks_stale_and_next_tick_reinjects() {
        let state = LinkState::Connected.on_silence();
        assert_eq!(state, LinkState::Stale);

        let (state, action) = state.on_tick(true, false);
        assert_eq!(state, LinkState::Injecting);
        assert_eq!(action, TickAction::Inject);
    }

    #[test]
    fn compositor_exit_disconnects_from_any_state() {
        for state in [
            LinkState::Disconnected,
            LinkState::Injecting,
            LinkState::Connected,
            LinkState::Stale,
        ] {
            let (next, action) = state.on_tick(false, false);
            assert_eq!(next, LinkState::Disconnected);
            assert_eq!(action, TickAction::None);
        }
    }

    #[test]
    fn agent_unload_while_connected_triggers_reinjection() {
        let (state, action) = LinkState::Connected.on_tick(true, false);
        assert_eq!(state, LinkState::Injecting);
        assert_eq!(action, TickAction::Inject);
    }
}
