//! Reconnecting WebSocket client for the platform's push channel.
//!
//! The connection lifecycle lives in [`SocketMachine`], a pure state machine that
//! turns events into actions. A driver task owns the actual tungstenite stream,
//! feeds it events and carries out the actions it returns:
//!
//! ```text
//! Disconnected --connect--> Connecting --opened--> Open
//!      ^                        |                   |  \
//!      |                   dial failed       closed !=1000  shutdown
//!      |                        v                   v        v
//!      +---- closed 1000 --- BackoffWait <----------+     Closing --closed--> Disconnected
//! ```
//!
//! At most one connection exists at a time. Every reconnect waits
//! `min(ceiling, base * 2^n)`; `n` resets once a connection opens. A heartbeat text
//! frame goes out on a fixed period while open.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::SocketConfig;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const HEARTBEAT_PAYLOAD: &str = "ping";

/// How long a deliberate close waits for the server's close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    pub fn from_config(cfg: &SocketConfig) -> Self {
        Self { base: cfg.backoff_base(), ceiling: cfg.backoff_ceiling() }
    }

    /// Delay before reconnect number `n` (zero-based).
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.ceiling).min(self.ceiling)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Open,
    /// A deliberate close is under way; no reconnect follows it.
    Closing,
    BackoffWait { attempt: u32, delay: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    ConnectRequested,
    Opened,
    ConnectFailed,
    Closed { code: Option<u16> },
    ShutdownRequested,
    BackoffElapsed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketAction {
    Dial,
    AbortDial,
    StartHeartbeat,
    StopHeartbeat,
    SendClose,
    /// A connection finished opening after shutdown; close it without reconnecting.
    Discard,
    ScheduleReconnect(Duration),
    CancelReconnect,
}

#[derive(Debug)]
pub struct SocketMachine {
    state: SocketState,
    failures: u32,
    policy: BackoffPolicy,
}

impl SocketMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { state: SocketState::Disconnected, failures: 0, policy }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Apply one event and return what the driver must do about it.
    pub fn handle(&mut self, event: SocketEvent) -> Vec<SocketAction> {
        use SocketAction as A;
        use SocketEvent as E;
        use SocketState as S;

        match (self.state, event) {
            (S::Disconnected, E::ConnectRequested) => {
                self.state = S::Connecting;
                vec![A::Dial]
            }
            (S::BackoffWait { .. }, E::ConnectRequested) | (S::BackoffWait { .. }, E::BackoffElapsed) => {
                self.state = S::Connecting;
                vec![A::CancelReconnect, A::Dial]
            }
            // Already connecting or connected: one connection at a time.
            (S::Connecting, E::ConnectRequested) | (S::Open, E::ConnectRequested) | (S::Closing, E::ConnectRequested) => {
                vec![]
            }

            (S::Connecting, E::Opened) => {
                self.failures = 0;
                self.state = S::Open;
                vec![A::StartHeartbeat]
            }
            (S::Connecting, E::ConnectFailed) => self.back_off(vec![]),

            (S::Open, E::Closed { code: Some(NORMAL_CLOSURE) }) => {
                self.state = S::Disconnected;
                vec![A::StopHeartbeat]
            }
            (S::Open, E::Closed { .. }) => self.back_off(vec![A::StopHeartbeat]),

            (S::Open, E::ShutdownRequested) => {
                self.state = S::Closing;
                vec![A::StopHeartbeat, A::SendClose]
            }
            (S::Connecting, E::ShutdownRequested) => {
                self.state = S::Disconnected;
                vec![A::AbortDial]
            }
            (S::BackoffWait { .. }, E::ShutdownRequested) => {
                self.state = S::Disconnected;
                vec![A::CancelReconnect]
            }

            (S::Closing, E::Closed { .. }) | (S::Closing, E::ConnectFailed) => {
                self.state = S::Disconnected;
                vec![]
            }
            (S::Disconnected, E::Opened) | (S::Closing, E::Opened) => vec![A::Discard],

            // Everything else is stale (a timer or close notice for a connection
            // that no longer matters).
            _ => vec![],
        }
    }

    fn back_off(&mut self, mut actions: Vec<SocketAction>) -> Vec<SocketAction> {
        let attempt = self.failures;
        let delay = self.policy.delay(attempt);
        self.failures = self.failures.saturating_add(1);
        self.state = SocketState::BackoffWait { attempt, delay };
        actions.push(SocketAction::ScheduleReconnect(delay));
        actions
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

enum Command {
    Connect,
    Send(String),
    Shutdown(oneshot::Sender<()>),
}

/// Owner side of a running socket. Dropping it closes the connection.
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SocketState>,
    task: JoinHandle<()>,
}

impl SocketHandle {
    /// Start the driver and connect right away.
    pub fn mount<H>(url: impl Into<String>, cfg: &SocketConfig, on_message: H) -> Self
    where
        H: FnMut(Inbound) + Send + 'static,
    {
        let url = url.into();
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SocketState::Disconnected);
        let driver = Driver {
            url: url.clone(),
            heartbeat: cfg.heartbeat(),
            machine: SocketMachine::new(BackoffPolicy::from_config(cfg)),
            next: Next::Idle,
            heartbeat_on: false,
            commands: rx,
            commands_open: true,
            state_tx,
            on_message,
            acks: Vec::new(),
        };
        let task = tokio::spawn(driver.run().instrument(tracing::info_span!("socket", %url)));
        let handle = Self { commands, state, task };
        handle.connect();
        handle
    }

    /// Ask for a connection. No-op while one is opening or open.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Queue a text frame. Frames sent while not open are dropped.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.commands.send(Command::Send(text.into())).is_ok()
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SocketState> {
        self.state.clone()
    }

    /// Close with code 1000 and wait for the driver to stop.
    pub async fn shutdown(self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        drop(self.commands);
        let _ = self.task.await;
    }
}

/// What the driver does once the current phase ends. Only the machine's
/// actions move it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Next {
    Idle,
    Dial,
    Reconnect(Duration),
}

struct Driver<H> {
    url: String,
    heartbeat: Duration,
    machine: SocketMachine,
    next: Next,
    heartbeat_on: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    state_tx: watch::Sender<SocketState>,
    on_message: H,
    acks: Vec<oneshot::Sender<()>>,
}

impl<H: FnMut(Inbound) + Send + 'static> Driver<H> {
    async fn run(mut self) {
        loop {
            match std::mem::replace(&mut self.next, Next::Idle) {
                Next::Idle => {
                    for ack in self.acks.drain(..) {
                        let _ = ack.send(());
                    }
                    if !self.commands_open {
                        break;
                    }
                    let cmd = self.commands.recv().await;
                    self.on_idle_command(cmd);
                }
                Next::Dial => {
                    let conn = Uuid::new_v4();
                    let span = tracing::info_span!("connection", %conn);
                    if let Some(ws) = self.dial().instrument(span.clone()).await {
                        self.session(ws).instrument(span).await;
                    }
                }
                Next::Reconnect(delay) => {
                    if let SocketState::BackoffWait { attempt, .. } = self.machine.state() {
                        info!(target: "socket", attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                    }
                    self.wait_backoff(delay).await;
                }
            }
        }
        debug!(target: "socket", "Socket driver stopped");
    }

    /// Feed one event to the machine and carry out the actions that do not need
    /// the live stream. `SendClose` and `Discard` are left to the caller holding it.
    fn apply(&mut self, event: SocketEvent) -> Vec<SocketAction> {
        let before = self.machine.state();
        let actions = self.machine.handle(event);
        let after = self.machine.state();
        if before != after {
            debug!(target: "socket", ?before, ?after, ?event, "Socket state changed");
            self.state_tx.send_replace(after);
        }
        for action in &actions {
            match *action {
                SocketAction::Dial => self.next = Next::Dial,
                SocketAction::ScheduleReconnect(delay) => self.next = Next::Reconnect(delay),
                SocketAction::AbortDial | SocketAction::CancelReconnect => self.next = Next::Idle,
                SocketAction::StartHeartbeat => self.heartbeat_on = true,
                SocketAction::StopHeartbeat => self.heartbeat_on = false,
                SocketAction::SendClose | SocketAction::Discard => {}
            }
        }
        actions
    }

    /// Handle a command that arrives while no connection is open.
    fn on_idle_command(&mut self, cmd: Option<Command>) -> Vec<SocketAction> {
        match cmd {
            Some(Command::Connect) => self.apply(SocketEvent::ConnectRequested),
            Some(Command::Send(_)) => {
                debug!(target: "socket", "Dropping outbound frame; socket not open");
                Vec::new()
            }
            Some(Command::Shutdown(ack)) => {
                self.acks.push(ack);
                self.apply(SocketEvent::ShutdownRequested)
            }
            None => {
                self.commands_open = false;
                self.apply(SocketEvent::ShutdownRequested)
            }
        }
    }

    async fn dial(&mut self) -> Option<WsStream> {
        let connecting = connect_async(self.url.clone());
        tokio::pin!(connecting);
        loop {
            tokio::select! {
                res = &mut connecting => {
                    return match res {
                        Ok((mut ws, _resp)) => {
                            if self.apply(SocketEvent::Opened).contains(&SocketAction::Discard) {
                                debug!(target: "socket", "Discarding connection opened after shutdown");
                                let _ = ws.close(None).await;
                                return None;
                            }
                            info!(target: "socket", "WebSocket connected");
                            Some(ws)
                        }
                        Err(e) => {
                            warn!(target: "socket", error = %e, "WebSocket connect failed");
                            self.apply(SocketEvent::ConnectFailed);
                            None
                        }
                    };
                }
                cmd = self.commands.recv(), if self.commands_open => {
                    if self.on_idle_command(cmd).contains(&SocketAction::AbortDial) {
                        debug!(target: "socket", "Dial abandoned");
                        return None;
                    }
                }
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => {
                    self.apply(SocketEvent::BackoffElapsed);
                    return;
                }
                cmd = self.commands.recv(), if self.commands_open => {
                    // Both a connect (dial now) and a shutdown cancel the pending reconnect.
                    if self.on_idle_command(cmd).contains(&SocketAction::CancelReconnect) {
                        return;
                    }
                }
            }
        }
    }

    async fn session(&mut self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => (self.on_message)(Inbound::Text(text)),
                    Some(Ok(Message::Binary(bytes))) => (self.on_message)(Inbound::Binary(bytes)),
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        info!(target: "socket", ?code, "Server closed the connection");
                        let _ = sink.close().await;
                        self.apply(SocketEvent::Closed { code });
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target: "socket", error = %e, "WebSocket error");
                        self.apply(SocketEvent::Closed { code: None });
                        return;
                    }
                    None => {
                        warn!(target: "socket", "WebSocket dropped without a close frame");
                        self.apply(SocketEvent::Closed { code: None });
                        return;
                    }
                },
                _ = heartbeat.tick(), if self.heartbeat_on => {
                    if let Err(e) = sink.send(Message::Text(HEARTBEAT_PAYLOAD.to_string())).await {
                        debug!(target: "socket", error = %e, "Heartbeat send failed");
                    }
                }
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(Command::Connect) => {
                        self.apply(SocketEvent::ConnectRequested);
                    }
                    Some(Command::Send(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            debug!(target: "socket", error = %e, "Outbound frame failed");
                        }
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.acks.push(ack);
                        self.close(sink, stream).await;
                        return;
                    }
                    None => {
                        self.commands_open = false;
                        self.close(sink, stream).await;
                        return;
                    }
                },
            }
        }
    }

    /// Deliberate close: send 1000, give the server a moment to answer, then stop.
    async fn close<S, R>(&mut self, mut sink: S, mut stream: R)
    where
        S: futures_util::Sink<Message> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        if self.apply(SocketEvent::ShutdownRequested).contains(&SocketAction::SendClose) {
            let frame = CloseFrame { code: CloseCode::Normal, reason: "client shutdown".into() };
            let _ = sink.send(Message::Close(Some(frame))).await;
            let answered = tokio::time::timeout(CLOSE_GRACE, async {
                while let Some(Ok(msg)) = stream.next().await {
                    if matches!(msg, Message::Close(_)) {
                        break;
                    }
                }
            })
            .await;
            if answered.is_err() {
                debug!(target: "socket", "No close reply from server");
            }
        }
        self.apply(SocketEvent::Closed { code: Some(NORMAL_CLOSURE) });
        info!(target: "socket", "WebSocket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    fn policy() -> BackoffPolicy {
        BackoffPolicy { base: Duration::from_secs(1), ceiling: Duration::from_secs(30) }
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let p = policy();
        let secs: Vec<u64> = (0..7).map(|n| p.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(p.delay(40), Duration::from_secs(30));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn abnormal_closes_back_off_and_reset_on_open() {
        let mut m = SocketMachine::new(policy());
        assert_eq!(m.handle(SocketEvent::ConnectRequested), vec![SocketAction::Dial]);
        assert_eq!(m.handle(SocketEvent::ConnectFailed), vec![SocketAction::ScheduleReconnect(Duration::from_secs(1))]);
        assert_eq!(m.state(), SocketState::BackoffWait { attempt: 0, delay: Duration::from_secs(1) });

        m.handle(SocketEvent::BackoffElapsed);
        assert_eq!(m.state(), SocketState::Connecting);
        assert_eq!(m.handle(SocketEvent::ConnectFailed), vec![SocketAction::ScheduleReconnect(Duration::from_secs(2))]);

        m.handle(SocketEvent::BackoffElapsed);
        assert_eq!(m.handle(SocketEvent::Opened), vec![SocketAction::StartHeartbeat]);
        assert_eq!(
            m.handle(SocketEvent::Closed { code: Some(1006) }),
            vec![SocketAction::StopHeartbeat, SocketAction::ScheduleReconnect(Duration::from_secs(1))]
        );
    }

    #[test]
    fn normal_closure_does_not_reconnect() {
        let mut m = SocketMachine::new(policy());
        m.handle(SocketEvent::ConnectRequested);
        m.handle(SocketEvent::Opened);
        assert_eq!(m.handle(SocketEvent::Closed { code: Some(NORMAL_CLOSURE) }), vec![SocketAction::StopHeartbeat]);
        assert_eq!(m.state(), SocketState::Disconnected);
        assert!(m.handle(SocketEvent::BackoffElapsed).is_empty());
    }

    #[test]
    fn closed_without_code_counts_as_abnormal() {
        let mut m = SocketMachine::new(policy());
        m.handle(SocketEvent::ConnectRequested);
        m.handle(SocketEvent::Opened);
        m.handle(SocketEvent::Closed { code: None });
        assert!(matches!(m.state(), SocketState::BackoffWait { attempt: 0, .. }));
    }

    #[test]
    fn only_one_connection_at_a_time() {
        let mut m = SocketMachine::new(policy());
        m.handle(SocketEvent::ConnectRequested);
        assert!(m.handle(SocketEvent::ConnectRequested).is_empty());
        m.handle(SocketEvent::Opened);
        assert!(m.handle(SocketEvent::ConnectRequested).is_empty());
        assert_eq!(m.state(), SocketState::Open);
    }

    #[test]
    fn connect_during_backoff_dials_immediately() {
        let mut m = SocketMachine::new(policy());
        m.handle(SocketEvent::ConnectRequested);
        m.handle(SocketEvent::ConnectFailed);
        assert_eq!(m.handle(SocketEvent::ConnectRequested), vec![SocketAction::CancelReconnect, SocketAction::Dial]);
        assert_eq!(m.state(), SocketState::Connecting);
    }

    #[test]
    fn shutdown_paths_never_schedule_a_reconnect() {
        let mut m = SocketMachine::new(policy());
        m.handle(SocketEvent::ConnectRequested);
        m.handle(SocketEvent::Opened);
        assert_eq!(m.handle(SocketEvent::ShutdownRequested), vec![SocketAction::StopHeartbeat, SocketAction::SendClose]);
        assert_eq!(m.state(), SocketState::Closing);
        // The server may answer with any code; a deliberate close stays closed.
        assert!(m.handle(SocketEvent::Closed { code: Some(1006) }).is_empty());
        assert_eq!(m.state(), SocketState::Disconnected);

        m.handle(SocketEvent::ConnectRequested);
        assert_eq!(m.handle(SocketEvent::ShutdownRequested), vec![SocketAction::AbortDial]);
        assert_eq!(m.handle(SocketEvent::Opened), vec![SocketAction::Discard]);
        assert_eq!(m.state(), SocketState::Disconnected);

        m.handle(SocketEvent::ConnectRequested);
        m.handle(SocketEvent::ConnectFailed);
        assert_eq!(m.handle(SocketEvent::ShutdownRequested), vec![SocketAction::CancelReconnect]);
        assert!(m.handle(SocketEvent::BackoffElapsed).is_empty());
        assert_eq!(m.state(), SocketState::Disconnected);
    }

    fn idle_driver() -> (Driver<impl FnMut(Inbound) + Send + 'static>, watch::Receiver<SocketState>) {
        let cfg = fast_config();
        let (_commands, rx) = mpsc::unbounded_channel();
        let (state_tx, states) = watch::channel(SocketState::Disconnected);
        let driver = Driver {
            url: "ws://127.0.0.1:9/ws".into(),
            heartbeat: cfg.heartbeat(),
            machine: SocketMachine::new(BackoffPolicy::from_config(&cfg)),
            next: Next::Idle,
            heartbeat_on: false,
            commands: rx,
            commands_open: true,
            state_tx,
            on_message: |_: Inbound| {},
            acks: Vec::new(),
        };
        (driver, states)
    }

    #[test]
    fn driver_steps_come_from_machine_actions() {
        let (mut d, states) = idle_driver();
        let base = Duration::from_millis(20);

        d.apply(SocketEvent::ConnectRequested);
        assert_eq!(d.next, Next::Dial);
        assert_eq!(*states.borrow(), SocketState::Connecting);

        // `run` takes the step before performing it.
        d.next = Next::Idle;
        d.apply(SocketEvent::ConnectFailed);
        assert_eq!(d.next, Next::Reconnect(base));

        d.next = Next::Idle;
        d.apply(SocketEvent::BackoffElapsed);
        assert_eq!(d.next, Next::Dial);

        d.next = Next::Idle;
        d.apply(SocketEvent::Opened);
        assert!(d.heartbeat_on);
        assert_eq!(d.next, Next::Idle);

        d.apply(SocketEvent::Closed { code: Some(1006) });
        assert!(!d.heartbeat_on);
        assert_eq!(d.next, Next::Reconnect(base));

        // Owner gone while waiting: the reconnect is cancelled and nothing follows.
        assert_eq!(d.on_idle_command(None), vec![SocketAction::CancelReconnect]);
        assert_eq!(d.next, Next::Idle);
        assert!(!d.commands_open);
        assert_eq!(*states.borrow(), SocketState::Disconnected);
    }

    #[test]
    fn connect_while_backing_off_switches_the_driver_to_dialing() {
        let (mut d, _states) = idle_driver();
        d.apply(SocketEvent::ConnectRequested);
        d.next = Next::Idle;
        d.apply(SocketEvent::ConnectFailed);
        assert_eq!(
            d.on_idle_command(Some(Command::Connect)),
            vec![SocketAction::CancelReconnect, SocketAction::Dial]
        );
        assert_eq!(d.next, Next::Dial);
        assert!(d.on_idle_command(Some(Command::Send("x".into()))).is_empty());
    }

    // ---- driver against a local axum server ----

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Greet, answer heartbeats, record the client's close code.
        Echo,
        /// Drop the first `n` connections without a close frame.
        DropFirst(usize),
        /// Close with 1000 right after the greeting.
        CloseNormal,
    }

    struct Server {
        behavior: Behavior,
        accepted: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        pings: AtomicUsize,
        close_codes: Mutex<Vec<u16>>,
    }

    async fn ws_route(ws: WebSocketUpgrade, State(srv): State<Arc<Server>>) -> impl IntoResponse {
        ws.on_upgrade(move |socket| serve_socket(socket, srv))
    }

    async fn serve_socket(mut socket: WebSocket, srv: Arc<Server>) {
        let nth = srv.accepted.fetch_add(1, Ordering::SeqCst) + 1;
        let now = srv.active.fetch_add(1, Ordering::SeqCst) + 1;
        srv.max_active.fetch_max(now, Ordering::SeqCst);

        match srv.behavior {
            Behavior::DropFirst(n) if nth <= n => {}
            Behavior::CloseNormal => {
                let _ = socket.send(AxumMessage::Text("hello".into())).await;
                let frame = AxumCloseFrame { code: NORMAL_CLOSURE, reason: "bye".into() };
                let _ = socket.send(AxumMessage::Close(Some(frame))).await;
                while let Some(Ok(_)) = socket.recv().await {}
            }
            _ => {
                let _ = socket.send(AxumMessage::Text("hello".into())).await;
                while let Some(Ok(msg)) = socket.recv().await {
                    match msg {
                        AxumMessage::Text(t) if t == HEARTBEAT_PAYLOAD => {
                            srv.pings.fetch_add(1, Ordering::SeqCst);
                            let _ = socket.send(AxumMessage::Text("pong".into())).await;
                        }
                        AxumMessage::Text(t) => {
                            let _ = socket.send(AxumMessage::Text(format!("echo:{t}"))).await;
                        }
                        AxumMessage::Close(frame) => {
                            if let Some(f) = frame {
                                srv.close_codes.lock().unwrap().push(f.code);
                            }
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
        srv.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn start(behavior: Behavior) -> (String, Arc<Server>) {
        let srv = Arc::new(Server {
            behavior,
            accepted: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            close_codes: Mutex::new(Vec::new()),
        });
        let app = Router::new().route("/ws", get(ws_route)).with_state(srv.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{addr}/ws"), srv)
    }

    fn fast_config() -> SocketConfig {
        SocketConfig { heartbeat_ms: 50, backoff_base_ms: 20, backoff_ceiling_ms: 100 }
    }

    fn collector() -> (impl FnMut(Inbound) + Send + 'static, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_message = move |msg: Inbound| {
            if let Inbound::Text(t) = msg {
                let _ = tx.send(t);
            }
        };
        (on_message, rx)
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("message in time").expect("channel open")
    }

    #[tokio::test]
    async fn heartbeats_flow_and_shutdown_sends_normal_closure() {
        let (url, srv) = start(Behavior::Echo).await;
        let (on_message, mut rx) = collector();
        let socket = SocketHandle::mount(url, &fast_config(), on_message);

        assert_eq!(next_text(&mut rx).await, "hello");
        assert_eq!(socket.state(), SocketState::Open);
        eventually("two heartbeats", || srv.pings.load(Ordering::SeqCst) >= 2).await;

        assert!(socket.send_text("oi"));
        let mut seen = Vec::new();
        while !seen.iter().any(|m: &String| m == "echo:oi") {
            seen.push(next_text(&mut rx).await);
        }

        let mut states = socket.subscribe();
        socket.shutdown().await;
        assert_eq!(*states.borrow_and_update(), SocketState::Disconnected);
        eventually("close frame recorded", || !srv.close_codes.lock().unwrap().is_empty()).await;
        assert_eq!(srv.close_codes.lock().unwrap().as_slice(), &[NORMAL_CLOSURE]);
        assert_eq!(srv.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abnormal_drops_reconnect_one_connection_at_a_time() {
        let (url, srv) = start(Behavior::DropFirst(2)).await;
        let (on_message, mut rx) = collector();
        let socket = SocketHandle::mount(url, &fast_config(), on_message);

        assert_eq!(next_text(&mut rx).await, "hello");
        assert_eq!(srv.accepted.load(Ordering::SeqCst), 3);
        assert_eq!(srv.max_active.load(Ordering::SeqCst), 1);
        socket.shutdown().await;
    }

    #[tokio::test]
    async fn normal_server_close_stays_disconnected() {
        let (url, srv) = start(Behavior::CloseNormal).await;
        let (on_message, mut rx) = collector();
        let socket = SocketHandle::mount(url, &fast_config(), on_message);

        assert_eq!(next_text(&mut rx).await, "hello");
        let mut states = socket.subscribe();
        // Map the result right away: a held `watch::Ref` would block the driver's next publish.
        let closed = tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == SocketState::Disconnected))
            .await
            .map(|r| r.is_ok());
        assert_eq!(closed, Ok(true));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(srv.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(socket.state(), SocketState::Disconnected);

        // An explicit connect afterwards opens a fresh connection.
        socket.connect();
        assert_eq!(next_text(&mut rx).await, "hello");
        assert_eq!(srv.accepted.load(Ordering::SeqCst), 2);
        socket.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_connect_while_open_is_ignored() {
        let (url, srv) = start(Behavior::Echo).await;
        let (on_message, mut rx) = collector();
        let socket = SocketHandle::mount(url, &fast_config(), on_message);
        assert_eq!(next_text(&mut rx).await, "hello");

        for _ in 0..3 {
            socket.connect();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(srv.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(socket.state(), SocketState::Open);
        socket.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_server_keeps_backing_off_until_shutdown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (on_message, _rx) = collector();
        let socket = SocketHandle::mount(format!("ws://{addr}/ws"), &fast_config(), on_message);
        let mut states = socket.subscribe();
        let waited = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, SocketState::BackoffWait { attempt, .. } if *attempt >= 2)),
        )
        .await
        .map(|r| r.is_ok());
        assert_eq!(waited, Ok(true));

        let stopped = tokio::time::timeout(Duration::from_secs(3), socket.shutdown()).await;
        assert!(stopped.is_ok(), "shutdown during backoff must return");
        assert_eq!(*states.borrow(), SocketState::Disconnected);
    }
}
