// src/services/mailbox.rs
//! Mailbox waiter: the cross-party rendezvous barrier.
//!
//! A joining party never signs its part of a group action before its own
//! mailbox shows the announcement for that action. Waiting is a bounded
//! list+filter poll driven by a [`RetryPolicy`]; consumed entries are marked
//! read (or deleted when retaining them could cause double processing).

use crate::error::{AgentError, CoordinationError, CoordinationResult};
use crate::models::notification::{Notification, Route};
use crate::services::exchange::DeliveryLedger;
use crate::utils::retry::RetryPolicy;
use crate::wallet::party::Party;
use log::{debug, info, warn};

/// One list+filter pass: every unread entry whose route equals `route`.
pub async fn unread(party: &Party, route: Route) -> CoordinationResult<Vec<Notification>> {
    let notes = party.agent().list_notifications().await?;
    Ok(notes.into_iter().filter(|n| n.is_unread_for(route)).collect())
}

/// Polls until at least one unread `route` entry exists.
///
/// # Errors
/// [`CoordinationError::NoMatchingNotification`] after exactly
/// `policy.max_attempts` list+filter passes without a match.
pub async fn wait_for(
    party: &Party,
    route: Route,
    policy: &RetryPolicy,
) -> CoordinationResult<Vec<Notification>> {
    policy
        .execute(|attempt| async move {
            let notes = unread(party, route).await?;
            if notes.is_empty() {
                debug!("mailbox empty party={} route={} attempt={}", party.name, route, attempt);
                return Err(CoordinationError::NoMatchingNotification { route, attempts: attempt });
            }
            Ok(notes)
        })
        .await
}

/// Marks `notes` read and returns how many were marked. Marking is mailbox
/// hygiene: a failure is logged and the remaining entries are still tried.
pub async fn mark_read(party: &Party, notes: &[Notification]) -> usize {
    let mut marked = 0;
    for note in notes {
        match party.agent().mark_notification(&note.i).await {
            Ok(()) => marked += 1,
            Err(e) => warn!("notification not marked party={} note={} error={}", party.name, note.i, e),
        }
    }
    marked
}

pub async fn mark_and_delete(party: &Party, notes: &[Notification]) -> CoordinationResult<()> {
    for note in notes {
        party.agent().mark_notification(&note.i).await?;
        party.agent().delete_notification(&note.i).await?;
    }
    Ok(())
}

fn last_said(notes: &[Notification], route: Route) -> CoordinationResult<String> {
    notes
        .last()
        .and_then(Notification::exchange_said)
        .map(String::from)
        .ok_or_else(|| AgentError::NotFound(format!("exchange reference on {} notification", route)).into())
}

/// Waits for `route`, marks every match read and returns the SAID of the
/// exchange behind the last one.
pub async fn wait_and_mark(party: &Party, route: Route, policy: &RetryPolicy) -> CoordinationResult<String> {
    let notes = wait_for(party, route, policy).await?;
    mark_read(party, &notes).await;
    info!("notification consumed party={} route={} count={}", party.name, route, notes.len());
    last_said(&notes, route)
}

/// Like [`wait_and_mark`] but also deletes the consumed entries.
pub async fn wait_and_consume(party: &Party, route: Route, policy: &RetryPolicy) -> CoordinationResult<String> {
    let notes = wait_for(party, route, policy).await?;
    mark_and_delete(party, &notes).await?;
    info!("notification removed party={} route={} count={}", party.name, route, notes.len());
    last_said(&notes, route)
}

/// Hygiene pass: consumes whatever `route` entries are there, logging and
/// swallowing any failure (including finding none).
pub async fn mark_best_effort(party: &Party, route: Route, policy: &RetryPolicy) -> Option<String> {
    match wait_and_mark(party, route, policy).await {
        Ok(said) => Some(said),
        Err(e) => {
            warn!("notification marking skipped party={} route={} error={}", party.name, route, e);
            None
        }
    }
}

/// Polls `party`'s mailbox until every peer in `ledger` has confirmed through
/// a `route` exchange. Confirmations are attributed by looking up the sender
/// of each announced exchange.
///
/// # Errors
/// [`CoordinationError::NoMatchingNotification`] if peers are still
/// unconfirmed after `policy.max_attempts` passes.
pub async fn await_confirmations(
    party: &Party,
    route: Route,
    ledger: &mut DeliveryLedger,
    policy: &RetryPolicy,
) -> CoordinationResult<()> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        for note in unread(party, route).await? {
            let Some(said) = note.exchange_said() else {
                continue;
            };
            match party.agent().get_exchange(said).await {
                Ok(record) => {
                    if ledger.confirm(&record.sender) {
                        debug!("confirmation received party={} route={} sender={}", party.name, route, record.sender);
                    }
                }
                Err(e) => warn!("confirmation lookup failed party={} said={} error={}", party.name, said, e),
            }
            mark_read(party, std::slice::from_ref(&note)).await;
        }
        if ledger.all_confirmed() {
            info!("all confirmations received party={} route={}", party.name, route);
            return Ok(());
        }
        if attempt < attempts {
            tokio::time::sleep(policy.calculate_delay(attempt - 1)).await;
        }
    }
    warn!(
        "confirmations missing party={} route={} pending={:?}",
        party.name,
        route,
        ledger.pending()
    );
    Err(CoordinationError::NoMatchingNotification { route, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::local::LocalNetwork;
    use crate::agent::IdentityAgent;
    use crate::services::testing::{group_of, quick};
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_wait_for_gives_up_after_exactly_max_attempts() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1"]).await;
        network.mute_mailbox("qar1", true).unwrap();

        let err = assert_err!(wait_for(&parties[0], Route::MultisigIcp, &quick(3)).await);
        assert!(matches!(err, CoordinationError::NoMatchingNotification { attempts: 3, .. }));
        let listings = network
            .calls("qar1")
            .unwrap()
            .into_iter()
            .filter(|c| c == "list_notifications")
            .count();
        assert_eq!(listings, 3);
    }

    #[tokio::test]
    async fn test_route_filter_is_exact() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        crate::services::testing::announce(&parties[0], &parties[1], Route::MultisigRpy).await;

        assert_err!(wait_for(&parties[1], Route::MultisigRot, &quick(2)).await);
        let said = assert_ok!(wait_and_mark(&parties[1], Route::MultisigRpy, &quick(2)).await);
        let record = parties[1].agent().get_exchange(&said).await.unwrap();
        assert_eq!(record.message.route, Route::MultisigRpy);

        // consumed entries no longer match
        assert!(unread(&parties[1], Route::MultisigRpy).await.unwrap().is_empty());
        assert!(mark_best_effort(&parties[1], Route::MultisigRpy, &quick(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_and_consume_deletes_entries() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        crate::services::testing::announce(&parties[0], &parties[1], Route::MultisigIcp).await;

        assert_ok!(wait_and_consume(&parties[1], Route::MultisigIcp, &quick(1)).await);
        assert!(parties[1].agent().list_notifications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_await_confirmations_tracks_senders() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2", "qar3"]).await;
        let peers: Vec<String> = crate::services::member_identifiers(&parties[1..])
            .await
            .unwrap()
            .into_iter()
            .map(|hab| hab.prefix)
            .collect();
        let mut ledger = DeliveryLedger::new(peers.clone());
        ledger.mark_sent(&peers);

        crate::services::testing::announce(&parties[1], &parties[0], Route::MultisigVcp).await;
        let err = assert_err!(await_confirmations(&parties[0], Route::MultisigVcp, &mut ledger, &quick(2)).await);
        assert!(matches!(err, CoordinationError::NoMatchingNotification { attempts: 2, .. }));
        assert_eq!(ledger.pending(), vec![peers[1].clone()]);

        crate::services::testing::announce(&parties[2], &parties[0], Route::MultisigVcp).await;
        assert_ok!(await_confirmations(&parties[0], Route::MultisigVcp, &mut ledger, &quick(2)).await);
        assert!(ledger.all_confirmed());
    }

    #[tokio::test]
    async fn test_marking_failures_do_not_abort() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        let peers = vec![parties[1].member_identifier().await.unwrap().prefix];
        let mut ledger = DeliveryLedger::new(peers.clone());
        ledger.mark_sent(&peers);
        network.fail_marking("qar1", true).unwrap();

        crate::services::testing::announce(&parties[1], &parties[0], Route::MultisigIss).await;
        assert_ok!(await_confirmations(&parties[0], Route::MultisigIss, &mut ledger, &quick(2)).await);
        assert!(ledger.all_confirmed());

        let said = assert_ok!(wait_and_mark(&parties[0], Route::MultisigIss, &quick(1)).await);
        assert!(!said.is_empty());
        let notes = unread(&parties[0], Route::MultisigIss).await.unwrap();
        assert_eq!(mark_read(&parties[0], &notes).await, 0);

        network.fail_marking("qar1", false).unwrap();
        assert_eq!(mark_read(&parties[0], &notes).await, 1);
        assert!(unread(&parties[0], Route::MultisigIss).await.unwrap().is_empty());
    }
}
