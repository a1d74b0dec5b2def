//! # Turn Coordinator
//!
//! Decides which turn of a call is current and relays each turn's reply.
//!
//! ## Turn Lifecycle:
//! 1. **Pending**: turn request accepted, relay task spawned
//! 2. **Streaming**: relay task consuming provider output
//! 3. **Completed**: terminal fragment sent to the caller
//! 4. **Failed**: relay error, terminal error fragment sent to the caller
//! 5. **Abandoned**: a newer turn was accepted; nothing more is sent
//!
//! ## Freshness:
//! The call's watermark is the `stream_id` of the last accepted `start_call`
//! or turn request. Only the read loop writes it. A turn whose id falls below
//! the watermark is stale. Accepting a new watermark also cancels the
//! per-turn token of every in-flight turn at or below it, so relays stop
//! waiting on the provider at once.
//!
//! Every outbound fragment carries its turn's token. The session writer
//! checks it again right before writing; that check runs on the same actor
//! as the read loop, so a fragment queued just before a newer turn arrived
//! is dropped rather than spoken.

use crate::prompt::PromptAssembler;
use crate::protocol::{InboundEvent, StreamResponse, TurnRequest};
use crate::relay::{CompletionProvider, ContentFragment, FragmentStream};
use crate::state::AppMetrics;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Pending,
    Streaming,
    Abandoned,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Streaming => "streaming",
            TurnStatus::Abandoned => "abandoned",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
        }
    }
}

/// One caller utterance and the reply generated for it.
#[derive(Debug)]
pub struct Turn {
    pub stream_id: i64,
    status: TurnStatus,
}

impl Turn {
    pub fn new(stream_id: i64) -> Self {
        Self {
            stream_id,
            status: TurnStatus::Pending,
        }
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    fn advance(&mut self, next: TurnStatus) {
        debug!(
            stream_id = self.stream_id,
            from = self.status.as_str(),
            to = next.as_str(),
            "Turn status changed"
        );
        self.status = next;
    }
}

/// Stream id of the most recent turn, or none before the first event.
///
/// Every `i64` is a valid caller id, so "no turn yet" is its own flag.
#[derive(Debug)]
pub struct Watermark {
    stream_id: AtomicI64,
    accepted: AtomicBool,
}

impl Watermark {
    pub fn new() -> Self {
        Self {
            stream_id: AtomicI64::new(0),
            accepted: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> Option<i64> {
        self.accepted
            .load(Ordering::Acquire)
            .then(|| self.stream_id.load(Ordering::Acquire))
    }

    fn set(&self, stream_id: i64) {
        self.stream_id.store(stream_id, Ordering::Release);
        self.accepted.store(true, Ordering::Release);
    }

    /// True once a strictly newer turn has been accepted.
    pub fn supersedes(&self, stream_id: i64) -> bool {
        self.current().map_or(false, |current| stream_id < current)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new()
    }
}

/// A fragment on its way to the socket.
#[derive(Debug)]
pub struct OutboundFragment {
    pub response: StreamResponse,
    guard: Option<CancellationToken>,
}

impl OutboundFragment {
    fn unguarded(response: StreamResponse) -> Self {
        Self {
            response,
            guard: None,
        }
    }

    /// The turn this fragment belongs to was abandoned after it was queued.
    pub fn is_abandoned(&self) -> bool {
        self.guard
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }
}

struct InFlightTurn {
    stream_id: i64,
    cancel: CancellationToken,
}

/// Per-call turn state machine. Owned by the connection's read loop.
pub struct TurnCoordinator {
    call_id: String,
    watermark: Arc<Watermark>,
    provider: Arc<dyn CompletionProvider>,
    assembler: PromptAssembler,
    greeting: String,
    outbound: mpsc::UnboundedSender<OutboundFragment>,
    metrics: Arc<AppMetrics>,
    session: CancellationToken,
    in_flight: Vec<InFlightTurn>,
}

impl TurnCoordinator {
    pub fn new(
        call_id: impl Into<String>,
        provider: Arc<dyn CompletionProvider>,
        assembler: PromptAssembler,
        greeting: impl Into<String>,
        outbound: mpsc::UnboundedSender<OutboundFragment>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            watermark: Arc::new(Watermark::new()),
            provider,
            assembler,
            greeting: greeting.into(),
            outbound,
            metrics,
            session: CancellationToken::new(),
            in_flight: Vec::new(),
        }
    }

    pub fn current_stream_id(&self) -> Option<i64> {
        self.watermark.current()
    }

    /// Apply one inbound event. Returns the relay task when a turn was started.
    pub fn handle(&mut self, event: InboundEvent) -> Option<JoinHandle<TurnStatus>> {
        match event {
            InboundEvent::StartCall { stream_id } => {
                self.start_call(stream_id);
                None
            }
            InboundEvent::TurnRequest(request) => Some(self.accept_turn(request)),
            InboundEvent::Observed(kind) => {
                debug!(call_id = %self.call_id, kind = kind.as_str(), "Observed caller event");
                None
            }
            InboundEvent::Unknown(kind) => {
                debug!(call_id = %self.call_id, kind = %kind, "Ignoring unknown event kind");
                None
            }
        }
    }

    fn start_call(&mut self, stream_id: i64) {
        info!(call_id = %self.call_id, stream_id, "Call started, sending greeting");
        // The greeting is this id's terminal fragment, so any turn holding the id goes
        self.advance_watermark(stream_id);

        let greeting = StreamResponse::terminal(stream_id, self.greeting.clone());
        if self.outbound.send(OutboundFragment::unguarded(greeting)).is_err() {
            debug!(call_id = %self.call_id, "Writer closed, greeting dropped");
        }
    }

    fn accept_turn(&mut self, request: TurnRequest) -> JoinHandle<TurnStatus> {
        let stream_id = request.stream_id;
        // A repeated id means the caller re-sent the turn with fresher context
        self.advance_watermark(stream_id);

        let messages = self.assembler.build(&request);
        info!(
            call_id = %self.call_id,
            stream_id,
            messages = messages.len(),
            "Turn accepted"
        );

        let cancel = self.session.child_token();
        self.in_flight.push(InFlightTurn {
            stream_id,
            cancel: cancel.clone(),
        });
        self.metrics.turn_started();

        let fragments = self.provider.stream(messages);
        let turn = Turn::new(stream_id);
        let link = TurnLink {
            stream_id,
            watermark: self.watermark.clone(),
            cancel,
            outbound: self.outbound.clone(),
        };
        let metrics = self.metrics.clone();
        let call_id = self.call_id.clone();

        tokio::spawn(async move {
            let status = relay_turn(turn, fragments, link).await;
            metrics.turn_finished(status);
            info!(call_id = %call_id, stream_id, status = status.as_str(), "Turn finished");
            status
        })
    }

    /// Move the watermark and cancel turns it leaves behind, including any
    /// turn that held the same id. Turns with a higher id keep running.
    fn advance_watermark(&mut self, stream_id: i64) {
        self.watermark.set(stream_id);

        self.in_flight.retain(|turn| {
            if turn.stream_id <= stream_id {
                turn.cancel.cancel();
            }
            !turn.cancel.is_cancelled()
        });
    }

    /// Stop every relay of this call. Nothing is sent afterwards.
    pub fn teardown(&mut self) {
        if !self.session.is_cancelled() {
            debug!(
                call_id = %self.call_id,
                in_flight = self.in_flight.len(),
                "Tearing down call"
            );
        }
        self.session.cancel();
        self.in_flight.clear();
    }
}

impl Drop for TurnCoordinator {
    fn drop(&mut self) {
        self.session.cancel();
    }
}

/// What a relay task needs to talk back to its call.
struct TurnLink {
    stream_id: i64,
    watermark: Arc<Watermark>,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<OutboundFragment>,
}

impl TurnLink {
    fn is_stale(&self) -> bool {
        self.cancel.is_cancelled() || self.watermark.supersedes(self.stream_id)
    }

    fn forward(&self, fragment: &ContentFragment) -> bool {
        let response = StreamResponse {
            stream_id: self.stream_id,
            content: fragment.content().to_string(),
            flush: true,
            end_of_stream: fragment.is_terminal(),
        };
        self.outbound
            .send(OutboundFragment {
                response,
                guard: Some(self.cancel.clone()),
            })
            .is_ok()
    }
}

/// Forward one turn's fragments until a terminal one, or until the turn goes stale.
///
/// The provider stream is dropped on return, which closes the upstream request.
async fn relay_turn(mut turn: Turn, mut fragments: FragmentStream, link: TurnLink) -> TurnStatus {
    turn.advance(TurnStatus::Streaming);

    loop {
        let next = tokio::select! {
            biased;
            _ = link.cancel.cancelled() => None,
            next = fragments.next() => Some(next),
        };

        let Some(next) = next else {
            turn.advance(TurnStatus::Abandoned);
            break;
        };

        if link.is_stale() {
            turn.advance(TurnStatus::Abandoned);
            break;
        }

        let fragment = next.unwrap_or_else(|| {
            warn!(stream_id = turn.stream_id, "Provider stream ended without a terminal fragment");
            ContentFragment::End
        });

        if !link.forward(&fragment) {
            // Socket gone; nothing left to talk to
            turn.advance(TurnStatus::Abandoned);
            break;
        }

        match fragment {
            ContentFragment::Delta(_) => {}
            ContentFragment::End => {
                turn.advance(TurnStatus::Completed);
                break;
            }
            ContentFragment::Failure(_) => {
                turn.advance(TurnStatus::Failed);
                break;
            }
        }
    }

    turn.status()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::ChatMessage;
    use crate::protocol::ObservedKind;
    use futures_util::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const GREETING: &str = "Bonjour, je vous écoute.";

    /// Replies keyed by the last user message of the prompt.
    #[derive(Default)]
    struct ScriptedProvider {
        scripts: Mutex<HashMap<String, FragmentStream>>,
    }

    impl ScriptedProvider {
        fn with(self, prompt: &str, fragments: FragmentStream) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(prompt.to_string(), fragments);
            self
        }
    }

    impl CompletionProvider for ScriptedProvider {
        fn stream(&self, messages: Vec<ChatMessage>) -> FragmentStream {
            let key = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.scripts
                .lock()
                .unwrap()
                .remove(&key)
                .unwrap_or_else(|| Box::pin(stream::empty()))
        }
    }

    fn script(fragments: Vec<ContentFragment>) -> FragmentStream {
        Box::pin(stream::iter(fragments))
    }

    fn script_then_hang(fragments: Vec<ContentFragment>) -> FragmentStream {
        Box::pin(stream::iter(fragments).chain(stream::pending()))
    }

    fn delta(text: &str) -> ContentFragment {
        ContentFragment::Delta(text.to_string())
    }

    fn turn_request(stream_id: i64, content: &str) -> InboundEvent {
        InboundEvent::TurnRequest(TurnRequest {
            stream_id,
            transcript: None,
            content: Some(content.to_string()),
            delta: None,
        })
    }

    fn coordinator(
        provider: ScriptedProvider,
    ) -> (
        TurnCoordinator,
        mpsc::UnboundedReceiver<OutboundFragment>,
        Arc<AppMetrics>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(AppMetrics::default());
        let coordinator = TurnCoordinator::new(
            "test-call",
            Arc::new(provider),
            PromptAssembler::new("system", "Bonjour"),
            GREETING,
            tx,
            metrics.clone(),
        );
        (coordinator, rx, metrics)
    }

    /// What the socket writer would actually send right now.
    fn written(rx: &mut mpsc::UnboundedReceiver<OutboundFragment>) -> Vec<StreamResponse> {
        let mut sent = Vec::new();
        while let Ok(fragment) = rx.try_recv() {
            if !fragment.is_abandoned() {
                sent.push(fragment.response);
            }
        }
        sent
    }

    async fn wait_for_output(rx: &mpsc::UnboundedReceiver<OutboundFragment>) {
        while rx.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_call_greets_immediately() {
        let (mut coordinator, mut rx, metrics) = coordinator(ScriptedProvider::default());
        assert_eq!(coordinator.current_stream_id(), None);

        let handle = coordinator.handle(InboundEvent::StartCall { stream_id: 7 });
        assert!(handle.is_none());
        assert_eq!(coordinator.current_stream_id(), Some(7));
        assert_eq!(written(&mut rx), vec![StreamResponse::terminal(7, GREETING)]);
        assert_eq!(metrics.snapshot().turns_started, 0);
    }

    #[tokio::test]
    async fn test_turn_relays_deltas_in_order() {
        let provider = ScriptedProvider::default().with(
            "hello",
            script(vec![delta("Hi"), delta(" there"), ContentFragment::End]),
        );
        let (mut coordinator, mut rx, metrics) = coordinator(provider);

        let handle = coordinator.handle(turn_request(2, "hello")).unwrap();
        assert_eq!(handle.await.unwrap(), TurnStatus::Completed);

        assert_eq!(
            written(&mut rx),
            vec![
                StreamResponse::partial(2, "Hi"),
                StreamResponse::partial(2, " there"),
                StreamResponse::terminal(2, ""),
            ]
        );
        assert_eq!(metrics.snapshot().turns_completed, 1);
    }

    #[tokio::test]
    async fn test_provider_failure_is_single_terminal_fragment() {
        let message = "erreur 402";
        let provider = ScriptedProvider::default().with(
            "hello",
            script(vec![ContentFragment::Failure(message.to_string())]),
        );
        let (mut coordinator, mut rx, metrics) = coordinator(provider);

        let handle = coordinator.handle(turn_request(5, "hello")).unwrap();
        assert_eq!(handle.await.unwrap(), TurnStatus::Failed);
        assert_eq!(written(&mut rx), vec![StreamResponse::terminal(5, message)]);
        assert_eq!(metrics.snapshot().turns_failed, 1);
    }

    #[tokio::test]
    async fn test_missing_terminal_fragment_is_supplied() {
        let provider = ScriptedProvider::default().with("hello", script(vec![delta("Oui")]));
        let (mut coordinator, mut rx, _) = coordinator(provider);

        let handle = coordinator.handle(turn_request(3, "hello")).unwrap();
        assert_eq!(handle.await.unwrap(), TurnStatus::Completed);
        assert_eq!(
            written(&mut rx),
            vec![StreamResponse::partial(3, "Oui"), StreamResponse::terminal(3, "")]
        );
    }

    #[tokio::test]
    async fn test_barge_in_before_first_fragment_silences_old_turn() {
        let provider = ScriptedProvider::default()
            .with("first", script_then_hang(Vec::new()))
            .with("second", script(vec![delta("B"), ContentFragment::End]));
        let (mut coordinator, mut rx, metrics) = coordinator(provider);

        let first = coordinator.handle(turn_request(1, "first")).unwrap();
        let second = coordinator.handle(turn_request(2, "second")).unwrap();

        assert_eq!(first.await.unwrap(), TurnStatus::Abandoned);
        assert_eq!(second.await.unwrap(), TurnStatus::Completed);

        let sent = written(&mut rx);
        assert!(sent.iter().all(|fragment| fragment.stream_id == 2));
        assert_eq!(sent.iter().filter(|fragment| fragment.end_of_stream).count(), 1);
        assert_eq!(metrics.snapshot().turns_abandoned, 1);
    }

    #[tokio::test]
    async fn test_barge_in_mid_reply_stops_forwarding() {
        let provider = ScriptedProvider::default()
            .with("first", script_then_hang(vec![delta("A")]))
            .with("second", script(vec![ContentFragment::End]));
        let (mut coordinator, mut rx, _) = coordinator(provider);

        let first = coordinator.handle(turn_request(1, "first")).unwrap();
        wait_for_output(&rx).await;
        assert_eq!(written(&mut rx), vec![StreamResponse::partial(1, "A")]);

        let second = coordinator.handle(turn_request(2, "second")).unwrap();
        assert_eq!(first.await.unwrap(), TurnStatus::Abandoned);
        assert_eq!(second.await.unwrap(), TurnStatus::Completed);

        // No terminal fragment for the abandoned turn
        assert_eq!(written(&mut rx), vec![StreamResponse::terminal(2, "")]);
    }

    #[tokio::test]
    async fn test_queued_fragment_of_superseded_turn_is_not_written() {
        let provider =
            ScriptedProvider::default().with("first", script_then_hang(vec![delta("late")]));
        let (mut coordinator, mut rx, _) = coordinator(provider);

        let first = coordinator.handle(turn_request(1, "first")).unwrap();
        wait_for_output(&rx).await;

        // Newer turn accepted before the writer got to the queued fragment
        coordinator.handle(turn_request(2, "unscripted"));
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.response.stream_id, 1);
        assert!(queued.is_abandoned());
        assert_eq!(first.await.unwrap(), TurnStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_same_stream_id_supersedes_in_flight_turn() {
        let provider = ScriptedProvider::default()
            .with("first", script_then_hang(Vec::new()))
            .with("again", script(vec![ContentFragment::End]));
        let (mut coordinator, mut rx, _) = coordinator(provider);

        let first = coordinator.handle(turn_request(4, "first")).unwrap();
        let again = coordinator.handle(turn_request(4, "again")).unwrap();

        assert_eq!(first.await.unwrap(), TurnStatus::Abandoned);
        assert_eq!(again.await.unwrap(), TurnStatus::Completed);
        assert_eq!(written(&mut rx), vec![StreamResponse::terminal(4, "")]);
    }

    #[tokio::test]
    async fn test_start_call_supersedes_older_turns() {
        let provider = ScriptedProvider::default().with("first", script_then_hang(Vec::new()));
        let (mut coordinator, mut rx, _) = coordinator(provider);

        let first = coordinator.handle(turn_request(1, "first")).unwrap();
        coordinator.handle(InboundEvent::StartCall { stream_id: 2 });

        assert_eq!(first.await.unwrap(), TurnStatus::Abandoned);
        assert_eq!(written(&mut rx), vec![StreamResponse::terminal(2, GREETING)]);
    }

    #[tokio::test]
    async fn test_start_call_with_in_flight_id_sends_one_terminal() {
        let provider = ScriptedProvider::default()
            .with("first", script(vec![delta("late"), ContentFragment::End]));
        let (mut coordinator, mut rx, _) = coordinator(provider);

        let first = coordinator.handle(turn_request(5, "first")).unwrap();
        coordinator.handle(InboundEvent::StartCall { stream_id: 5 });

        assert_eq!(first.await.unwrap(), TurnStatus::Abandoned);
        let sent = written(&mut rx);
        assert_eq!(sent, vec![StreamResponse::terminal(5, GREETING)]);
        assert_eq!(sent.iter().filter(|fragment| fragment.end_of_stream).count(), 1);
    }

    #[tokio::test]
    async fn test_lower_id_moves_watermark_down_without_cancelling_newer_turn() {
        let provider = ScriptedProvider::default()
            .with("five", script(vec![delta("cinq"), ContentFragment::End]))
            .with("three", script(vec![ContentFragment::End]));
        let (mut coordinator, mut rx, _) = coordinator(provider);

        let five = coordinator.handle(turn_request(5, "five")).unwrap();
        let three = coordinator.handle(turn_request(3, "three")).unwrap();
        assert_eq!(coordinator.current_stream_id(), Some(3));

        assert_eq!(five.await.unwrap(), TurnStatus::Completed);
        assert_eq!(three.await.unwrap(), TurnStatus::Completed);

        let sent = written(&mut rx);
        assert!(sent.contains(&StreamResponse::partial(5, "cinq")));
        assert!(sent.contains(&StreamResponse::terminal(5, "")));
        assert!(sent.contains(&StreamResponse::terminal(3, "")));
        assert_eq!(sent.len(), 3);
    }

    #[tokio::test]
    async fn test_teardown_stops_relays_without_sending() {
        let provider = ScriptedProvider::default().with("first", script_then_hang(Vec::new()));
        let (mut coordinator, mut rx, _) = coordinator(provider);

        let first = coordinator.handle(turn_request(1, "first")).unwrap();
        coordinator.teardown();

        assert_eq!(first.await.unwrap(), TurnStatus::Abandoned);
        assert!(written(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_closed_writer_abandons_turn() {
        let provider = ScriptedProvider::default()
            .with("hello", script(vec![delta("Hi"), ContentFragment::End]));
        let (mut coordinator, rx, _) = coordinator(provider);
        drop(rx);

        let handle = coordinator.handle(turn_request(1, "hello")).unwrap();
        assert_eq!(handle.await.unwrap(), TurnStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_informational_events_change_nothing() {
        let (mut coordinator, mut rx, _) = coordinator(ScriptedProvider::default());
        coordinator.handle(InboundEvent::StartCall { stream_id: 3 });
        written(&mut rx);

        assert!(coordinator
            .handle(InboundEvent::Observed(ObservedKind::Interrupt))
            .is_none());
        assert!(coordinator
            .handle(InboundEvent::Unknown("ping_pong".to_string()))
            .is_none());
        assert_eq!(coordinator.current_stream_id(), Some(3));
        assert!(written(&mut rx).is_empty());
    }

    #[test]
    fn test_watermark() {
        let watermark = Watermark::new();
        assert_eq!(watermark.current(), None);
        assert!(!watermark.supersedes(0));

        watermark.set(5);
        assert_eq!(watermark.current(), Some(5));
        assert!(watermark.supersedes(4));
        assert!(!watermark.supersedes(5));
        assert!(!watermark.supersedes(6));
    }

    #[test]
    fn test_watermark_accepts_every_id() {
        let watermark = Watermark::new();
        watermark.set(i64::MIN);
        assert_eq!(watermark.current(), Some(i64::MIN));
        assert!(!watermark.supersedes(i64::MIN));

        watermark.set(0);
        assert!(watermark.supersedes(i64::MIN));
    }
}
