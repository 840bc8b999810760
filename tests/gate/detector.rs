use futures_util::stream;
use proptest::prelude::*;

use gatekeeper::{
    gate::{detector::OutcomeDetector, types::GateFragment},
    inference::dispatcher::{DispatchFragment, DispatchStream},
};

use crate::{MARKER, drain};

const SIGNAL: &str = "[ACCESS GRANTED]";

fn upstream(fragments: Vec<DispatchFragment>) -> DispatchStream {
    Box::pin(stream::iter(fragments))
}

fn texts(fragments: &[&str]) -> Vec<DispatchFragment> {
    fragments
        .iter()
        .map(|f| DispatchFragment::Text(f.to_string()))
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime should build")
}

#[tokio::test]
async fn given_reply_with_trailing_marker_when_streamed_then_caller_sees_text_and_gate_open_only() {
    let (stream, report) =
        OutcomeDetector::new(MARKER).attach(upstream(texts(&["Clever. [[GATE:test]]"])), SIGNAL);

    let fragments = drain(stream).await;

    assert_eq!(
        fragments,
        vec![
            GateFragment::Text("Clever. ".to_string()),
            GateFragment::GateOpen(SIGNAL.to_string()),
        ]
    );
    let report = report.await.expect("report should be delivered");
    assert!(report.granted);
    assert!(!report.exhausted);
    assert_eq!(report.reply, "Clever.");
}

#[tokio::test]
async fn given_marker_as_its_own_fragment_when_streamed_then_it_is_suppressed() {
    let (stream, _report) =
        OutcomeDetector::new(MARKER).attach(upstream(texts(&["Clever. ", MARKER])), SIGNAL);

    let fragments = drain(stream).await;

    assert_eq!(
        fragments,
        vec![
            GateFragment::Text("Clever. ".to_string()),
            GateFragment::GateOpen(SIGNAL.to_string()),
        ]
    );
}

#[tokio::test]
async fn given_reply_without_marker_when_streamed_then_no_gate_open_is_emitted() {
    let (stream, report) =
        OutcomeDetector::new(MARKER).attach(upstream(texts(&["Textbook.", " Next."])), SIGNAL);

    let fragments = drain(stream).await;

    assert!(fragments.iter().all(|f| !f.is_terminal()));
    assert!(!report.await.expect("report").granted);
}

#[tokio::test]
async fn given_exhausted_dispatch_when_streamed_then_failure_is_terminal_and_not_a_grant() {
    let mut items = texts(&["partial "]);
    items.push(DispatchFragment::Exhausted("asleep".to_string()));
    let (stream, report) = OutcomeDetector::new(MARKER).attach(upstream(items), SIGNAL);

    let fragments = drain(stream).await;

    assert_eq!(
        fragments.last(),
        Some(&GateFragment::Failure("asleep".to_string()))
    );
    let report = report.await.expect("report");
    assert!(report.exhausted);
    assert!(!report.granted);
}

#[tokio::test]
async fn given_marker_before_exhaustion_when_streamed_then_grant_still_follows_failure() {
    let mut items = texts(&["Fine. ", MARKER]);
    items.push(DispatchFragment::Exhausted("asleep".to_string()));
    let (stream, report) = OutcomeDetector::new(MARKER).attach(upstream(items), SIGNAL);

    let fragments = drain(stream).await;

    assert_eq!(
        fragments,
        vec![
            GateFragment::Text("Fine. ".to_string()),
            GateFragment::Failure("asleep".to_string()),
            GateFragment::GateOpen(SIGNAL.to_string()),
        ]
    );
    assert!(report.await.expect("report").granted);
}

#[tokio::test]
async fn given_stream_dropped_early_when_awaiting_report_then_sender_is_gone() {
    let (stream, report) =
        OutcomeDetector::new(MARKER).attach(upstream(texts(&["a", "b"])), SIGNAL);
    drop(stream);

    assert!(report.await.is_err());
}

#[derive(Debug, Clone)]
enum Piece {
    Filler(String),
    WholeMarker,
    MarkerGluedToFiller(String),
    SplitMarker(usize),
}

fn arb_piece() -> impl Strategy<Value = Piece> {
    prop_oneof![
        3 => "[a-z .,]{1,12}".prop_map(Piece::Filler),
        1 => Just(Piece::WholeMarker),
        1 => "[a-z .,]{0,8}".prop_map(Piece::MarkerGluedToFiller),
        1 => (1..MARKER.len()).prop_map(Piece::SplitMarker),
    ]
}

fn fragments_for(pieces: &[Piece]) -> Vec<String> {
    let mut fragments = Vec::new();
    for piece in pieces {
        match piece {
            Piece::Filler(text) => fragments.push(text.clone()),
            Piece::WholeMarker => fragments.push(MARKER.to_string()),
            Piece::MarkerGluedToFiller(text) => fragments.push(format!("{text}{MARKER}")),
            Piece::SplitMarker(at) => {
                let (head, tail) = MARKER.split_at(*at);
                fragments.push(head.to_string());
                fragments.push(tail.to_string());
            }
        }
    }
    fragments
}

fn run_detector(fragments: Vec<String>) -> (Vec<GateFragment>, bool) {
    runtime().block_on(async move {
        let items = fragments.into_iter().map(DispatchFragment::Text).collect();
        let (stream, report) = OutcomeDetector::new(MARKER).attach(upstream(items), SIGNAL);
        let forwarded = drain(stream).await;
        let granted = report.await.expect("report").granted;
        (forwarded, granted)
    })
}

proptest! {
    #[test]
    fn prop_exactly_one_gate_open_iff_marker_in_concatenation(
        pieces in prop::collection::vec(arb_piece(), 0..12)
    ) {
        let fragments = fragments_for(&pieces);
        let contains_marker = fragments.concat().contains(MARKER);

        let (forwarded, granted) = run_detector(fragments);
        let gate_opens = forwarded
            .iter()
            .filter(|f| matches!(f, GateFragment::GateOpen(_)))
            .count();

        prop_assert_eq!(gate_opens, usize::from(contains_marker));
        prop_assert_eq!(granted, contains_marker);
        if contains_marker {
            prop_assert_eq!(forwarded.last(), Some(&GateFragment::GateOpen(SIGNAL.to_string())));
        }
    }

    #[test]
    fn prop_unsplit_marker_never_reaches_the_caller(
        pieces in prop::collection::vec(
            prop_oneof![
                3 => "[a-z .,]{1,12}".prop_map(Piece::Filler),
                1 => Just(Piece::WholeMarker),
                1 => "[a-z .,]{0,8}".prop_map(Piece::MarkerGluedToFiller),
            ],
            0..12,
        )
    ) {
        let (forwarded, _) = run_detector(fragments_for(&pieces));

        for fragment in &forwarded {
            prop_assert!(
                !fragment.text().contains(MARKER),
                "marker leaked in {:?}",
                fragment
            );
        }
    }
}
