//! Slave state machine.
//!
//! Two orthogonal parts:
//! - setup: `Resting → Initing → Resting → Loading → Resting → GraphLoading →
//!   Resting`, with `Terminated` reachable from anywhere;
//! - rendering: `NotRendering → FrameStarted → Updating → DrawReady →
//!   DrawSent → Drawing → FrameDone`, only entered once the scene graph is
//!   loaded.
//!
//! [`SlaveMachine::handle`] is a pure transition function: it never touches
//! the network. It returns the effects the driver must carry out, or a
//! rejection that leaves the machine untouched.

use std::fmt;

use tracing::debug;

/// Setup progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupState {
    Resting,
    /// Environment requested, not yet received.
    Initing,
    /// Project requested, not yet received.
    Loading,
    /// Scene graph requested, not yet received.
    GraphLoading,
    Terminated,
}

/// Per-frame progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderState {
    NotRendering,
    /// `FRAME_START` received.
    FrameStarted,
    /// Waiting for the frame's updates.
    Updating,
    /// `DRAW_READY` sent.
    DrawReady,
    /// `DRAW` received.
    DrawSent,
    /// `DRAWING` sent, renderer running.
    Drawing,
    /// `DRAW_DONE` sent.
    FrameDone,
}

/// Inputs to the machine: received messages and local completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveEvent {
    /// Local: start the setup sequence.
    Begin,
    /// Local: environment retry interval elapsed.
    RetryTimer,
    EnvironmentReceived,
    /// Local: `REG_RENDERING` sent.
    ProjectRequested,
    ProjectReceived,
    /// Local: `REQ_SG_UPDATE` sent.
    GraphRequested,
    GraphReceived,
    FrameStart { frame: u32 },
    /// Local: updates are applied through `through`.
    UpdatesApplied { through: u32 },
    Draw { frame: u32 },
    /// Local: `DRAWING` sent.
    DrawStarted,
    /// Local: the renderer finished `frame`.
    DrawFinished { frame: u32 },
    Shutdown,
}

/// Work the driver performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveEffect {
    /// Send `REG_UPDATES`.
    RequestEnvironment,
    /// Send `REG_RENDERING`, then feed [`SlaveEvent::ProjectRequested`].
    RequestProject,
    /// Send `REQ_SG_UPDATE`, then feed [`SlaveEvent::GraphRequested`].
    RequestGraph,
    SendDrawReady { frame: u32 },
    /// Send `DRAWING`, then feed [`SlaveEvent::DrawStarted`].
    SendDrawing { frame: u32 },
    /// Run the renderer, then feed [`SlaveEvent::DrawFinished`].
    Render { frame: u32 },
    SendDrawDone { frame: u32 },
    Terminate,
}

/// Outcome of [`SlaveMachine::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(Vec<SlaveEffect>),
    Rejected(Rejection),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn effects(self) -> Vec<SlaveEffect> {
        match self {
            Transition::Applied(effects) => effects,
            Transition::Rejected(_) => Vec::new(),
        }
    }
}

/// An event with no transition from the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub setup: SetupState,
    pub render: RenderState,
    pub event: SlaveEvent,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no transition for {:?} in {:?}/{:?}",
            self.event, self.setup, self.render
        )
    }
}

/// The slave's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveMachine {
    setup: SetupState,
    render: RenderState,
    frame: u32,
    has_environment: bool,
    has_project: bool,
    ready_for_rendering: bool,
}

impl Default for SlaveMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveMachine {
    pub fn new() -> Self {
        Self {
            setup: SetupState::Resting,
            render: RenderState::NotRendering,
            frame: 0,
            has_environment: false,
            has_project: false,
            ready_for_rendering: false,
        }
    }

    pub fn setup(&self) -> SetupState {
        self.setup
    }

    pub fn render(&self) -> RenderState {
        self.render
    }

    /// Frame of the current or last render cycle.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn has_environment(&self) -> bool {
        self.has_environment
    }

    pub fn has_project(&self) -> bool {
        self.has_project
    }

    pub fn is_ready(&self) -> bool {
        self.ready_for_rendering
    }

    pub fn is_terminated(&self) -> bool {
        self.setup == SetupState::Terminated
    }

    /// Applies one event.
    pub fn handle(&mut self, event: SlaveEvent) -> Transition {
        use RenderState as R;
        use SetupState as S;
        use SlaveEffect as E;
        use SlaveEvent as Ev;

        let applied = match (self.setup, self.render, event) {
            (S::Terminated, _, _) => None,
            (_, _, Ev::Shutdown) => {
                self.setup = S::Terminated;
                self.render = R::NotRendering;
                self.ready_for_rendering = false;
                Some(vec![E::Terminate])
            }

            // Setup.
            (S::Resting, _, Ev::Begin) if !self.has_environment => {
                self.setup = S::Initing;
                Some(vec![E::RequestEnvironment])
            }
            (S::Initing, _, Ev::RetryTimer) => Some(vec![E::RequestEnvironment]),
            (S::Initing, _, Ev::EnvironmentReceived) => {
                self.setup = S::Resting;
                self.has_environment = true;
                Some(vec![E::RequestProject])
            }
            (S::Resting, _, Ev::ProjectRequested) if self.has_environment && !self.has_project => {
                self.setup = S::Loading;
                Some(Vec::new())
            }
            (S::Loading, _, Ev::ProjectReceived) => {
                self.setup = S::Resting;
                self.has_project = true;
                Some(vec![E::RequestGraph])
            }
            (S::Resting, _, Ev::GraphRequested) if self.has_project && !self.ready_for_rendering => {
                self.setup = S::GraphLoading;
                Some(Vec::new())
            }
            (S::GraphLoading, _, Ev::GraphReceived) => {
                self.setup = S::Resting;
                self.ready_for_rendering = true;
                Some(Vec::new())
            }

            // Rendering. A newer FRAME_START abandons an unfinished frame.
            (S::Resting, render, Ev::FrameStart { frame })
                if self.ready_for_rendering
                    && (matches!(render, R::NotRendering | R::FrameDone) || frame > self.frame) =>
            {
                if !matches!(render, R::NotRendering | R::FrameDone) {
                    debug!(old = self.frame, new = frame, ?render, "Abandoning unfinished frame");
                }
                self.render = R::FrameStarted;
                self.frame = frame;
                Some(Vec::new())
            }
            (S::Resting, R::FrameStarted | R::Updating, Ev::UpdatesApplied { through }) => {
                if through >= self.frame {
                    self.render = R::DrawReady;
                    Some(vec![E::SendDrawReady { frame: self.frame }])
                } else {
                    self.render = R::Updating;
                    Some(Vec::new())
                }
            }
            (S::Resting, R::DrawReady, Ev::Draw { frame }) if frame == self.frame => {
                self.render = R::DrawSent;
                Some(vec![E::SendDrawing { frame }])
            }
            (S::Resting, R::DrawSent, Ev::DrawStarted) => {
                self.render = R::Drawing;
                Some(vec![E::Render { frame: self.frame }])
            }
            (S::Resting, R::Drawing, Ev::DrawFinished { frame }) if frame == self.frame => {
                self.render = R::FrameDone;
                Some(vec![E::SendDrawDone { frame }])
            }

            _ => None,
        };

        match applied {
            Some(effects) => Transition::Applied(effects),
            None => {
                let rejection = Rejection {
                    setup: self.setup,
                    render: self.render,
                    event,
                };
                debug!(%rejection, "Slave event rejected");
                Transition::Rejected(rejection)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives a machine through setup the way the driver does.
    fn ready_machine() -> SlaveMachine {
        let mut m = SlaveMachine::new();
        for event in [
            SlaveEvent::Begin,
            SlaveEvent::EnvironmentReceived,
            SlaveEvent::ProjectRequested,
            SlaveEvent::ProjectReceived,
            SlaveEvent::GraphRequested,
            SlaveEvent::GraphReceived,
        ] {
            assert!(m.handle(event).is_applied(), "{event:?}");
        }
        m
    }

    fn all_events(frame: u32) -> Vec<SlaveEvent> {
        vec![
            SlaveEvent::Begin,
            SlaveEvent::RetryTimer,
            SlaveEvent::EnvironmentReceived,
            SlaveEvent::ProjectRequested,
            SlaveEvent::ProjectReceived,
            SlaveEvent::GraphRequested,
            SlaveEvent::GraphReceived,
            SlaveEvent::FrameStart { frame },
            SlaveEvent::FrameStart { frame: frame + 1 },
            SlaveEvent::UpdatesApplied { through: frame },
            SlaveEvent::UpdatesApplied { through: frame.saturating_sub(1) },
            SlaveEvent::Draw { frame },
            SlaveEvent::Draw { frame: frame + 7 },
            SlaveEvent::DrawStarted,
            SlaveEvent::DrawFinished { frame },
            SlaveEvent::DrawFinished { frame: frame + 7 },
            SlaveEvent::Shutdown,
        ]
    }

    /// One machine per reachable state.
    fn reachable() -> Vec<SlaveMachine> {
        let mut out = vec![SlaveMachine::new()];
        let mut m = SlaveMachine::new();
        for event in [
            SlaveEvent::Begin,
            SlaveEvent::EnvironmentReceived,
            SlaveEvent::ProjectRequested,
            SlaveEvent::ProjectReceived,
            SlaveEvent::GraphRequested,
            SlaveEvent::GraphReceived,
            SlaveEvent::FrameStart { frame: 4 },
            SlaveEvent::UpdatesApplied { through: 3 },
            SlaveEvent::UpdatesApplied { through: 4 },
            SlaveEvent::Draw { frame: 4 },
            SlaveEvent::DrawStarted,
            SlaveEvent::DrawFinished { frame: 4 },
            SlaveEvent::Shutdown,
        ] {
            m.handle(event);
            out.push(m.clone());
        }
        out
    }

    #[test]
    fn environment_receipt_rests_and_requests_project() {
        let mut m = SlaveMachine::new();
        assert_eq!(
            m.handle(SlaveEvent::Begin),
            Transition::Applied(vec![SlaveEffect::RequestEnvironment])
        );
        assert_eq!(m.setup(), SetupState::Initing);
        assert_eq!(
            m.handle(SlaveEvent::RetryTimer),
            Transition::Applied(vec![SlaveEffect::RequestEnvironment])
        );
        assert_eq!(
            m.handle(SlaveEvent::EnvironmentReceived),
            Transition::Applied(vec![SlaveEffect::RequestProject])
        );
        assert_eq!(m.setup(), SetupState::Resting);
        assert!(m.has_environment());
    }

    #[test]
    fn retry_only_while_initing() {
        let mut m = SlaveMachine::new();
        assert!(!m.handle(SlaveEvent::RetryTimer).is_applied());
        let m = ready_machine();
        let mut copy = m.clone();
        assert!(!copy.handle(SlaveEvent::RetryTimer).is_applied());
        assert_eq!(copy, m);
    }

    #[test]
    fn frame_start_rejected_until_graph_loaded() {
        let mut m = SlaveMachine::new();
        m.handle(SlaveEvent::Begin);
        m.handle(SlaveEvent::EnvironmentReceived);
        m.handle(SlaveEvent::ProjectRequested);
        m.handle(SlaveEvent::ProjectReceived);
        let before = m.clone();
        assert!(matches!(
            m.handle(SlaveEvent::FrameStart { frame: 1 }),
            Transition::Rejected(_)
        ));
        assert_eq!(m, before);
    }

    #[test]
    fn full_frame_cycle() {
        let mut m = ready_machine();
        assert!(m.handle(SlaveEvent::FrameStart { frame: 9 }).is_applied());
        assert_eq!(m.render(), RenderState::FrameStarted);

        assert_eq!(
            m.handle(SlaveEvent::UpdatesApplied { through: 8 }),
            Transition::Applied(vec![])
        );
        assert_eq!(m.render(), RenderState::Updating);
        assert_eq!(
            m.handle(SlaveEvent::UpdatesApplied { through: 9 }),
            Transition::Applied(vec![SlaveEffect::SendDrawReady { frame: 9 }])
        );
        assert_eq!(
            m.handle(SlaveEvent::Draw { frame: 9 }),
            Transition::Applied(vec![SlaveEffect::SendDrawing { frame: 9 }])
        );
        assert_eq!(
            m.handle(SlaveEvent::DrawStarted),
            Transition::Applied(vec![SlaveEffect::Render { frame: 9 }])
        );
        assert_eq!(
            m.handle(SlaveEvent::DrawFinished { frame: 9 }),
            Transition::Applied(vec![SlaveEffect::SendDrawDone { frame: 9 }])
        );
        assert_eq!(m.render(), RenderState::FrameDone);
        assert!(m.handle(SlaveEvent::FrameStart { frame: 10 }).is_applied());
    }

    #[test]
    fn draw_for_other_frame_is_rejected() {
        let mut m = ready_machine();
        m.handle(SlaveEvent::FrameStart { frame: 3 });
        m.handle(SlaveEvent::UpdatesApplied { through: 3 });
        let before = m.clone();
        assert!(!m.handle(SlaveEvent::Draw { frame: 2 }).is_applied());
        assert_eq!(m, before);
    }

    #[test]
    fn newer_frame_start_abandons_stuck_frame() {
        let mut m = ready_machine();
        m.handle(SlaveEvent::FrameStart { frame: 3 });
        m.handle(SlaveEvent::UpdatesApplied { through: 3 });
        assert!(!m.handle(SlaveEvent::FrameStart { frame: 3 }).is_applied());
        assert!(m.handle(SlaveEvent::FrameStart { frame: 4 }).is_applied());
        assert_eq!(m.frame(), 4);
        assert_eq!(m.render(), RenderState::FrameStarted);
    }

    #[test]
    fn shutdown_is_terminal() {
        let mut m = ready_machine();
        assert_eq!(
            m.handle(SlaveEvent::Shutdown),
            Transition::Applied(vec![SlaveEffect::Terminate])
        );
        assert!(m.is_terminated());
        for event in all_events(1) {
            let before = m.clone();
            assert!(!m.handle(event).is_applied());
            assert_eq!(m, before);
        }
    }

    #[test]
    fn rejected_events_never_change_state() {
        for machine in reachable() {
            for event in all_events(machine.frame()) {
                let mut m = machine.clone();
                if let Transition::Rejected(r) = m.handle(event) {
                    assert_eq!(m, machine, "{r}");
                    assert_eq!(r.event, event);
                }
            }
        }
    }
}
