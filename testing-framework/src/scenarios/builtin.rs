//! Built-in crash cases

use super::parser::{ChannelPair, CrashSpec, ScenarioSpec, TransferSpec};
use crate::config::ScenarioTiming;
use crate::invariants::{ChannelExpectation, LockPattern, Outcome};
use crate::node::CrashCheckpoint;

fn expect(a: &str, b: &str, pattern: LockPattern) -> ChannelExpectation {
    ChannelExpectation {
        a: a.to_string(),
        b: b.to_string(),
        expect: pattern,
        amount: None,
    }
}

/// N3 quits right after sending a refund transfer
///
/// N2 sends 45 to N6 through N3 with N3 armed at
/// `EventSendRefundTransferAfter`. After N3 restarts and retries, the
/// transfer has failed: channel(N2,N3) is locked 45 on both sides,
/// channel(N6,N3) holds no lock, channel(N2,N7) is locked 45 by N2 and
/// channel(N3,N7) is locked 45 by N3.
///
/// Expects a topology with nodes `N2`, `N3`, `N6`, `N7` and token `token`.
pub fn crash_case_send_06(token: &str) -> ScenarioSpec {
    ScenarioSpec {
        name: "CrashCaseSend06".to_string(),
        description: "Crash after sending the refund transfer".to_string(),
        start: vec!["N2".into(), "N6".into(), "N7".into()],
        crash: CrashSpec {
            node: "N3".to_string(),
            checkpoint: CrashCheckpoint::new("EventSendRefundTransferAfter"),
        },
        transfer: TransferSpec {
            source: "N2".to_string(),
            target: "N6".to_string(),
            token: token.to_string(),
            amount: 45,
        },
        probe: vec![
            ChannelPair::new("N2", "N3"),
            ChannelPair::new("N6", "N3"),
            ChannelPair::new("N2", "N7"),
            ChannelPair::new("N3", "N7"),
        ],
        outcomes: vec![Outcome {
            name: Some("refund retried".to_string()),
            channels: vec![
                expect("N2", "N3", LockPattern::LockBoth),
                expect("N6", "N3", LockPattern::NoLock),
                expect("N2", "N7", LockPattern::LockSide { node: "N2".into() }),
                expect("N3", "N7", LockPattern::LockSide { node: "N3".into() }),
            ],
        }],
        timing: ScenarioTiming::default(),
        verify_idempotent_restart: false,
    }
}

/// Built-in case by name
pub fn builtin(name: &str, token: &str) -> Option<ScenarioSpec> {
    match name {
        "CrashCaseSend06" | "crash_case_send_06" => Some(crash_case_send_06(token)),
        _ => None,
    }
}
