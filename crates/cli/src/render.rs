//! Plain-text rendering of engine output for the terminal.

use pairlink_core::event::{Event, EventPayload, NoticeLevel};
use pairlink_core::state::{ConnectionState, Phase};
use pairlink_session::{CommandOutcome, StoreSnapshot};

pub fn state_line(state: &ConnectionState) -> String {
    let mut line = match state.phase {
        Phase::Open => "connected".to_string(),
        Phase::Connecting => "waiting for pairing".to_string(),
        Phase::Restoring => "restoring session".to_string(),
        other => format!("not connected ({other})"),
    };
    if let Some(code) = &state.pairing_code {
        line.push_str("\npairing code: ");
        line.push_str(code.as_str());
    }
    line
}

pub fn snapshot_line(snapshot: &StoreSnapshot) -> Option<String> {
    let state = snapshot.state.as_ref()?;
    let source = if snapshot.push_live { "push" } else { "poll" };
    Some(format!("[{source}] {}", state_line(state)))
}

pub fn outcome_line(outcome: &CommandOutcome) -> String {
    let status = if outcome.success { "ok" } else { "failed" };
    let mut line = format!("{status}: {}", outcome.message);
    if let Some(code) = &outcome.qr {
        line.push_str("\npairing code: ");
        line.push_str(code.as_str());
    }
    line
}

/// One line per event the user should see; `None` for internal chatter.
pub fn event_line(event: &Event) -> Option<String> {
    match &event.payload {
        EventPayload::NoticeRaised { level, message, .. } => {
            let tag = match level {
                NoticeLevel::Success => "ok",
                NoticeLevel::Info => "info",
                NoticeLevel::Error => "error",
            };
            Some(format!("[{tag}] {message}"))
        }
        EventPayload::ChannelReconnecting { attempt, delay_ms } => Some(format!(
            "push channel lost, retry {attempt} in {:.1}s",
            *delay_ms as f64 / 1000.0
        )),
        EventPayload::CampaignProgress {
            id,
            sent,
            failed,
            total,
        } => Some(format!(
            "campaign {id}: {sent}/{total} sent, {failed} failed"
        )),
        EventPayload::CampaignFinished { id, completed } => Some(if *completed {
            format!("campaign {id} finished")
        } else {
            format!("campaign {id} stopped before completion")
        }),
        _ => None,
    }
}
