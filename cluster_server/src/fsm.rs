//! Master state machines.
//!
//! - [`ClientLink`]: one per slave. Setup walks
//!   `Unknown → InitRequested → InitDone → LoadRequested → LoadDone →
//!   GraphRequested → Resting`; the render part walks
//!   `NotRendering → FrameStarted → DrawReady → DrawSent → Drawing →
//!   FrameDone` once per frame.
//! - [`GlobalMachine`]: the frame phase across all slaves plus an orthogonal
//!   health flag.
//!
//! Both are pure: `handle` returns a [`Transition`] and a rejected event
//! leaves the machine exactly as it was.

use std::fmt;

use tracing::{debug, warn};

/// Setup progress of one slave as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkSetup {
    Unknown,
    /// `REG_UPDATES` received.
    InitRequested,
    /// `ENVIRONMENT` acknowledged.
    InitDone,
    /// `REG_RENDERING` received.
    LoadRequested,
    /// `PROJECT` acknowledged.
    LoadDone,
    /// `REQ_SG_UPDATE` received.
    GraphRequested,
    /// `SG_INIT` acknowledged. The slave takes part in frames.
    Resting,
}

/// Frame progress of one slave as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRender {
    NotRendering,
    /// `FRAME_START` sent.
    FrameStarted,
    /// `DRAW_READY` received.
    DrawReady,
    /// `DRAW` sent.
    DrawSent,
    /// `DRAWING` received.
    Drawing,
    /// `DRAW_DONE` received.
    FrameDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    RegUpdates,
    EnvironmentAcked,
    RegRendering,
    ProjectAcked,
    ReqGraph,
    SnapshotAcked,
    /// Local: `FRAME_START` for `frame` went out.
    FrameStarted { frame: u32 },
    DrawReady { frame: u32 },
    /// Local: `DRAW` for `frame` went out.
    DrawSent { frame: u32 },
    Drawing { frame: u32 },
    DrawDone { frame: u32 },
    /// Local: the frame is closed, or the slave stalled a barrier.
    Reset,
}

/// An event with no transition from the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection<S, E> {
    pub state: S,
    pub event: E,
}

impl<S: fmt::Debug, E: fmt::Debug> fmt::Display for Rejection<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no transition for {:?} in {:?}", self.event, self.state)
    }
}

/// Outcome of a `handle` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<S, E> {
    Applied,
    /// A frame-tagged message for a frame other than the current one. The
    /// render part was reset to [`LinkRender::NotRendering`].
    OutOfFrame { expected: u32, got: u32 },
    Rejected(Rejection<S, E>),
}

impl<S, E> Transition<S, E> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

pub type LinkTransition = Transition<(LinkSetup, LinkRender), LinkEvent>;

/// Per-slave machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLink {
    setup: LinkSetup,
    render: LinkRender,
    frame: u32,
}

impl Default for ClientLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientLink {
    pub fn new() -> Self {
        Self {
            setup: LinkSetup::Unknown,
            render: LinkRender::NotRendering,
            frame: 0,
        }
    }

    pub fn setup(&self) -> LinkSetup {
        self.setup
    }

    pub fn render(&self) -> LinkRender {
        self.render
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Ready for rendering: takes part in frames.
    pub fn is_ready(&self) -> bool {
        self.setup == LinkSetup::Resting
    }

    /// Should be sent `SG_CREATE`/`SG_UPDATE`. A slave loading its snapshot
    /// queues updates until the snapshot lands.
    pub fn receives_updates(&self) -> bool {
        matches!(self.setup, LinkSetup::GraphRequested | LinkSetup::Resting)
    }

    /// `DRAW_READY` for `frame` has arrived.
    pub fn update_satisfied(&self, frame: u32) -> bool {
        self.frame == frame
            && matches!(
                self.render,
                LinkRender::DrawReady | LinkRender::DrawSent | LinkRender::Drawing | LinkRender::FrameDone
            )
    }

    /// `DRAWING` for `frame` has arrived.
    pub fn draw_started(&self, frame: u32) -> bool {
        self.frame == frame && matches!(self.render, LinkRender::Drawing | LinkRender::FrameDone)
    }

    /// `DRAW_DONE` for `frame` has arrived.
    pub fn draw_finished(&self, frame: u32) -> bool {
        self.frame == frame && self.render == LinkRender::FrameDone
    }

    pub fn handle(&mut self, event: LinkEvent) -> LinkTransition {
        use LinkEvent as Ev;
        use LinkRender as R;
        use LinkSetup as S;

        // Frame-tagged replies from the slave.
        if let Ev::DrawReady { frame } | Ev::Drawing { frame } | Ev::DrawDone { frame } = event {
            if self.is_ready() && self.render != R::NotRendering && frame != self.frame {
                warn!(expected = self.frame, got = frame, ?event, "Out-of-frame reply, resetting slave");
                let expected = self.frame;
                self.render = R::NotRendering;
                return Transition::OutOfFrame { expected, got: frame };
            }
        }

        let applied = match (self.setup, self.render, event) {
            // A repeated REG_UPDATES asks for the environment again.
            (S::Unknown | S::InitRequested, _, Ev::RegUpdates) => {
                self.setup = S::InitRequested;
                true
            }
            (S::InitRequested, _, Ev::EnvironmentAcked) => {
                self.setup = S::InitDone;
                true
            }
            // The environment ack may be lost while the slave moves on.
            (S::InitRequested | S::InitDone | S::LoadRequested, _, Ev::RegRendering) => {
                self.setup = S::LoadRequested;
                true
            }
            (S::LoadRequested, _, Ev::ProjectAcked) => {
                self.setup = S::LoadDone;
                true
            }
            (S::LoadRequested | S::LoadDone | S::GraphRequested, _, Ev::ReqGraph) => {
                self.setup = S::GraphRequested;
                true
            }
            (S::GraphRequested, _, Ev::SnapshotAcked) => {
                self.setup = S::Resting;
                true
            }
            // Resync snapshots of a ready slave.
            (S::Resting, _, Ev::ReqGraph | Ev::SnapshotAcked) => true,

            (S::Resting, R::NotRendering | R::FrameDone, Ev::FrameStarted { frame }) if frame > self.frame => {
                self.render = R::FrameStarted;
                self.frame = frame;
                true
            }
            (S::Resting, R::FrameStarted, Ev::DrawReady { .. }) => {
                self.render = R::DrawReady;
                true
            }
            (S::Resting, R::DrawReady, Ev::DrawSent { frame }) if frame == self.frame => {
                self.render = R::DrawSent;
                true
            }
            (S::Resting, R::DrawSent, Ev::Drawing { .. }) => {
                self.render = R::Drawing;
                true
            }
            (S::Resting, R::Drawing, Ev::DrawDone { .. }) => {
                self.render = R::FrameDone;
                true
            }
            (_, _, Ev::Reset) => {
                self.render = R::NotRendering;
                true
            }

            _ => false,
        };

        if applied {
            Transition::Applied
        } else {
            let rejection = Rejection {
                state: (self.setup, self.render),
                event,
            };
            debug!(%rejection, "Link event rejected");
            Transition::Rejected(rejection)
        }
    }
}

/// Frame phase across all slaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalState {
    /// No slave seen yet.
    Unknown,
    /// Slaves are connecting, none ready.
    Initing,
    NotRendering,
    Updating,
    Rendering,
    Swapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    AllOk,
    /// A barrier timed out and its grace period is running.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalEvent {
    ClientSeen,
    ClientReady,
    BeginUpdate { ready_clients: usize },
    BeginRender,
    BeginSwap,
    EndFrame,
    /// Drop an unfinished frame.
    Abandon,
}

pub type GlobalTransition = Transition<GlobalState, GlobalEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalMachine {
    state: GlobalState,
    health: Health,
}

impl Default for GlobalMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMachine {
    pub fn new() -> Self {
        Self {
            state: GlobalState::Unknown,
            health: Health::AllOk,
        }
    }

    pub fn state(&self) -> GlobalState {
        self.state
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn set_health(&mut self, health: Health) {
        if self.health != health {
            debug!(from = ?self.health, to = ?health, "Health changed");
            self.health = health;
        }
    }

    pub fn handle(&mut self, event: GlobalEvent) -> GlobalTransition {
        use GlobalEvent as Ev;
        use GlobalState as G;

        let next = match (self.state, event) {
            (G::Unknown, Ev::ClientSeen) => Some(G::Initing),
            (G::Initing, Ev::ClientReady) => Some(G::NotRendering),
            (G::NotRendering, Ev::BeginUpdate { ready_clients }) if ready_clients > 0 => Some(G::Updating),
            (G::Updating, Ev::BeginRender) => Some(G::Rendering),
            (G::Rendering, Ev::BeginSwap) => Some(G::Swapping),
            (G::Swapping, Ev::EndFrame) => Some(G::NotRendering),
            (G::Updating | G::Rendering | G::Swapping, Ev::Abandon) => Some(G::NotRendering),
            _ => None,
        };

        match next {
            Some(state) => {
                self.state = state;
                Transition::Applied
            }
            None => {
                let rejection = Rejection {
                    state: self.state,
                    event,
                };
                debug!(%rejection, "Global event rejected");
                Transition::Rejected(rejection)
            }
        }
    }
}
