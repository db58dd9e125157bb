// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Game session debit engine.
//!
//! ## Lifecycle
//!
//! ```text
//! start_session ──► Start ──freeze──► (Pending Freeze) ──end_session──► End ──confirm_session──► Settled | Auditing
//! ```
//!
//! One session per (user, game) may be in Start at a time, and a session
//! holds at most one Pending Freeze row. Both rules are unique indexes, so a
//! retried or concurrent call finds the existing record instead of creating a
//! second one.

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::spend::{load_spend_flow, prior_resolution, resolve_freeze, Resolution, SpendReceipt};
use super::{check_external_field, Ledger};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    AccountBalance, Direction, GameInfo, GameSession, GameStatus, Page, SessionStatus,
    SpendBizType, SpendFlow, SpendStatus, DEFAULT_ASSET_ID,
};
use crate::storage::ledger_db::PENDING_FREEZE;

/// Parameters of a per-play freeze.
#[derive(Debug, Clone, Copy)]
pub struct SessionFreeze<'a> {
    pub client_id: &'a str,
    pub setting_code: &'a str,
    pub external_id: Option<&'a str>,
    pub remark: Option<&'a str>,
}

/// Whether a game accepts plays, and whether those plays are test plays.
fn playable(game: &GameInfo) -> LedgerResult<bool> {
    match game.status {
        GameStatus::Active => Ok(false),
        GameStatus::Testing => Ok(true),
        GameStatus::Draft | GameStatus::Inactive => Err(LedgerError::Validation(format!(
            "game {} is not open for play",
            game.game_id
        ))),
    }
}

impl Ledger {
    fn load_game(&self, game_id: u64) -> LedgerResult<GameInfo> {
        self.db
            .get_game(game_id)?
            .ok_or_else(|| LedgerError::not_found(format!("game {game_id}")))
    }

    fn load_owned_session(&self, main_id: u64, session_id: &str) -> LedgerResult<GameSession> {
        let session = self
            .db
            .get_session(session_id)?
            .ok_or_else(|| LedgerError::not_found(format!("session {session_id}")))?;
        if session.main_id != main_id {
            return Err(LedgerError::NotOwner(format!("session {session_id}")));
        }
        Ok(session)
    }

    /// Open a session, or return the one already in Start for this game.
    pub fn start_session(&self, main_id: u64, game_id: u64) -> LedgerResult<String> {
        match self.open_session(main_id, game_id) {
            Err(LedgerError::AlreadyActive(existing)) => {
                tracing::debug!(main_id, game_id, session_id = %existing, "Reusing active session");
                Ok(existing)
            }
            other => other,
        }
    }

    /// Open a new session; fails with `AlreadyActive(existing_id)` if one is in Start.
    pub fn open_session(&self, main_id: u64, game_id: u64) -> LedgerResult<String> {
        let game = self.load_game(game_id)?;
        let testing = playable(&game)?;

        let session_id = Uuid::new_v4().to_string();
        let txn = self.db.begin()?;
        if let Some(existing) = txn.claim_active_session(main_id, game_id, &session_id)? {
            return Err(LedgerError::AlreadyActive(existing));
        }
        txn.insert_session(&GameSession {
            session_id: session_id.clone(),
            main_id,
            game_id,
            status: SessionStatus::Start,
            start_time: Utc::now(),
            end_time: None,
            score: None,
            user_report_score: None,
            spend_amount: 0,
            testing,
        })?;
        txn.commit()?;

        tracing::info!(main_id, game_id, session_id = %session_id, testing, "Game session started");
        Ok(session_id)
    }

    /// Hold the price of one play for `session_id`.
    pub fn freeze(&self, main_id: u64, session_id: &str, req: SessionFreeze<'_>) -> LedgerResult<SpendReceipt> {
        if req.setting_code.trim().is_empty() {
            return Err(LedgerError::validation("setting_code is required"));
        }
        if let Some(external_id) = req.external_id {
            check_external_field("external_id", external_id)?;
        }
        if let Some(remark) = req.remark {
            check_external_field("remark", remark)?;
        }

        let session = self.load_owned_session(main_id, session_id)?;
        if session.status != SessionStatus::Start {
            return Err(LedgerError::Validation(format!("session {session_id} is not started")));
        }
        let setting = self
            .db
            .get_setting(session.game_id, req.setting_code)?
            .ok_or_else(|| LedgerError::not_found(format!("setting {}", req.setting_code)))?;
        let game = self.load_game(session.game_id)?;
        let price = setting.amount_per_play;
        if playable(&game)? && price > 0 {
            return Err(LedgerError::Validation(format!(
                "game {} is in testing and only allows free plays",
                game.game_id
            )));
        }

        let txn = self.db.begin()?;
        if let Some(id) = txn.index_get(PENDING_FREEZE, &(main_id, session_id))? {
            let existing = load_spend_flow(&txn, id)?;
            return Ok(SpendReceipt {
                flow_id: existing.id,
                amount: existing.amount,
                replayed: true,
            });
        }
        // The session may have ended since it was loaded above
        let current = txn
            .get_session(session_id)?
            .ok_or_else(|| LedgerError::not_found(format!("session {session_id}")))?;
        if current.status != SessionStatus::Start {
            return Err(LedgerError::Validation(format!("session {session_id} is not started")));
        }

        // A free play may create the balance row; a paid one needs funds
        let mut balance = match txn.lock_balance(main_id, DEFAULT_ASSET_ID)? {
            Some(balance) => balance,
            None if price == 0 => AccountBalance::zero(main_id, DEFAULT_ASSET_ID),
            None => {
                return Err(LedgerError::InsufficientBalance {
                    available: 0,
                    required: price,
                })
            }
        };
        balance.freeze(price)?;

        let now = Utc::now();
        let mut flow = SpendFlow {
            id: 0,
            main_id,
            asset_id: DEFAULT_ASSET_ID,
            biz_type: SpendBizType::Freeze,
            amount: price,
            direction: Direction::Out,
            client_id: req.client_id.to_string(),
            game_id: Some(session.game_id),
            session_id: Some(session_id.to_string()),
            external_id: req.external_id.map(str::to_string),
            external_remark: req.remark.map(str::to_string),
            ref_flow_id: None,
            status: SpendStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        txn.insert_spend_flow(&mut flow)?;
        if let Some(existing) = txn.index_claim(PENDING_FREEZE, &(main_id, session_id), flow.id)? {
            // Dropping txn discards the debit
            let existing = load_spend_flow(&txn, existing)?;
            return Ok(SpendReceipt {
                flow_id: existing.id,
                amount: existing.amount,
                replayed: true,
            });
        }
        txn.save_balance(&mut balance)?;
        txn.commit()?;

        tracing::info!(
            main_id,
            session_id,
            flow_id = flow.id,
            amount = price,
            setting_code = req.setting_code,
            "Froze play price"
        );
        Ok(SpendReceipt {
            flow_id: flow.id,
            amount: price,
            replayed: false,
        })
    }

    /// Finish a session: spend its freeze and record the score.
    ///
    /// `game_id` is the game of the calling client; it must match the session.
    pub fn end_session(
        &self,
        main_id: u64,
        game_id: u64,
        session_id: &str,
        freeze_flow_id: u64,
        score: Decimal,
    ) -> LedgerResult<SpendReceipt> {
        let session = self.load_owned_session(main_id, session_id)?;
        if session.game_id != game_id {
            return Err(LedgerError::NotOwner(format!(
                "session {session_id} belongs to another game"
            )));
        }

        let txn = self.db.begin()?;
        let mut freeze = load_spend_flow(&txn, freeze_flow_id)?;
        if freeze.main_id != main_id
            || freeze.biz_type != SpendBizType::Freeze
            || freeze.session_id.as_deref() != Some(session_id)
        {
            return Err(LedgerError::Validation(format!(
                "flow {freeze_flow_id} is not a freeze of session {session_id}"
            )));
        }

        if let Some(prior) = prior_resolution(&txn, freeze_flow_id)? {
            if prior.biz_type == SpendBizType::Spend {
                return Ok(SpendReceipt {
                    flow_id: prior.id,
                    amount: prior.amount,
                    replayed: true,
                });
            }
            return Err(LedgerError::AlreadyResolved(format!(
                "flow {freeze_flow_id} was reversed by flow {}",
                prior.id
            )));
        }

        let mut session = txn
            .get_session(session_id)?
            .ok_or_else(|| LedgerError::not_found(format!("session {session_id}")))?;
        if session.status != SessionStatus::Start {
            return Err(LedgerError::Validation(format!("session {session_id} is not started")));
        }
        if freeze.status != SpendStatus::Pending {
            return Err(LedgerError::AlreadyResolved(format!(
                "flow {freeze_flow_id} is {:?}",
                freeze.status
            )));
        }

        let spend = resolve_freeze(&txn, &mut freeze, Resolution::Spend)?;

        session.status = SessionStatus::End;
        session.end_time = Some(Utc::now());
        session.score = Some(score);
        session.spend_amount = spend.amount;
        txn.update_session(&session)?;
        txn.release_active_session(main_id, session.game_id)?;
        txn.commit()?;

        tracing::info!(
            main_id,
            session_id,
            spend_flow_id = spend.id,
            amount = spend.amount,
            score = %score,
            "Game session ended"
        );
        Ok(SpendReceipt {
            flow_id: spend.id,
            amount: spend.amount,
            replayed: false,
        })
    }

    /// Compare the user's reported score with the server's.
    pub fn confirm_session(
        &self,
        main_id: u64,
        session_id: &str,
        reported_score: Decimal,
    ) -> LedgerResult<SessionStatus> {
        let txn = self.db.begin()?;
        let mut session = txn
            .get_session(session_id)?
            .ok_or_else(|| LedgerError::not_found(format!("session {session_id}")))?;
        if session.main_id != main_id {
            return Err(LedgerError::NotOwner(format!("session {session_id}")));
        }
        match session.status {
            SessionStatus::End => {}
            SessionStatus::Settled | SessionStatus::Auditing => {
                return Err(LedgerError::AlreadyProcessed(format!(
                    "session {session_id} is {:?}",
                    session.status
                )))
            }
            SessionStatus::Start | SessionStatus::Reversed => {
                return Err(LedgerError::Validation(format!("session {session_id} has not ended")))
            }
        }

        session.user_report_score = Some(reported_score);
        session.status = if session.score == Some(reported_score) {
            SessionStatus::Settled
        } else {
            tracing::warn!(
                main_id,
                session_id,
                reported = %reported_score,
                server = ?session.score,
                "Score mismatch, session sent to audit"
            );
            SessionStatus::Auditing
        };
        txn.update_session(&session)?;
        txn.commit()?;
        Ok(session.status)
    }

    /// Sessions of a user, newest first.
    pub fn list_sessions(
        &self,
        main_id: u64,
        status: Option<SessionStatus>,
        page: usize,
        limit: usize,
    ) -> LedgerResult<Page<GameSession>> {
        let mut sessions = self.db.list_sessions(main_id)?;
        if let Some(status) = status {
            sessions.retain(|s| s.status == status);
        }
        Ok(Page::from_sorted(sessions, page, limit))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ledger::test_support::{add_game, fund, ledger, GAME};

    const USER: u64 = 1;

    fn play(code: &str) -> SessionFreeze<'_> {
        SessionFreeze {
            client_id: "game-app",
            setting_code: code,
            external_id: None,
            remark: None,
        }
    }

    #[test]
    fn freeze_then_end_session() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[("std", 300_000)]);
        fund(&ledger, USER, 1_000_000);

        let session_id = ledger.start_session(USER, GAME).unwrap();
        let freeze = ledger.freeze(USER, &session_id, play("std")).unwrap();
        let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.frozen), (700_000, 300_000));

        let spend = ledger
            .end_session(USER, GAME, &session_id, freeze.flow_id, Decimal::new(4200, 2))
            .unwrap();
        let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.frozen), (700_000, 0));

        let row = ledger.db().get_spend_flow(spend.flow_id).unwrap().unwrap();
        assert_eq!(row.biz_type, SpendBizType::Spend);
        assert_eq!(row.status, SpendStatus::Done);
        let session = ledger.db().get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::End);
        assert_eq!(session.spend_amount, 300_000);
        assert_eq!(session.score, Some(Decimal::new(4200, 2)));

        // The slot is free again
        let next = ledger.start_session(USER, GAME).unwrap();
        assert_ne!(next, session_id);
    }

    #[test]
    fn start_session_is_idempotent_per_game() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[]);
        let first = ledger.start_session(USER, GAME).unwrap();
        assert_eq!(ledger.start_session(USER, GAME).unwrap(), first);
        assert!(matches!(
            ledger.open_session(USER, GAME),
            Err(LedgerError::AlreadyActive(id)) if id == first
        ));
        assert_eq!(ledger.list_sessions(USER, None, 1, 50).unwrap().total, 1);
    }

    #[test]
    fn closed_games_cannot_start() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Inactive, &[]);
        assert!(matches!(ledger.start_session(USER, GAME), Err(LedgerError::Validation(_))));
        assert!(matches!(ledger.start_session(USER, 404), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn testing_games_only_allow_free_plays() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Testing, &[("free", 0), ("paid", 10)]);
        let session_id = ledger.start_session(USER, GAME).unwrap();
        assert!(ledger.db().get_session(&session_id).unwrap().unwrap().testing);

        assert!(matches!(
            ledger.freeze(USER, &session_id, play("paid")),
            Err(LedgerError::Validation(_))
        ));
        // Free play creates the balance row lazily
        let freeze = ledger.freeze(USER, &session_id, play("free")).unwrap();
        assert_eq!(freeze.amount, 0);
        assert!(ledger.db().get_balance(USER, DEFAULT_ASSET_ID).unwrap().is_some());
    }

    #[test]
    fn paid_play_without_balance_row_is_rejected() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[("std", 5)]);
        let session_id = ledger.start_session(USER, GAME).unwrap();
        assert!(matches!(
            ledger.freeze(USER, &session_id, play("std")),
            Err(LedgerError::InsufficientBalance { available: 0, required: 5 })
        ));
        assert!(ledger.db().get_balance(USER, DEFAULT_ASSET_ID).unwrap().is_none());
    }

    #[test]
    fn repeated_freeze_returns_the_pending_row() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[("std", 100)]);
        fund(&ledger, USER, 1_000);
        let session_id = ledger.start_session(USER, GAME).unwrap();
        let first = ledger.freeze(USER, &session_id, play("std")).unwrap();
        let second = ledger.freeze(USER, &session_id, play("std")).unwrap();
        assert!(second.replayed);
        assert_eq!(first.flow_id, second.flow_id);
        assert_eq!(ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap().available, 900);
    }

    #[test]
    fn concurrent_freezes_debit_once() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[("std", 100)]);
        fund(&ledger, USER, 1_000);
        let session_id: Arc<str> = ledger.start_session(USER, GAME).unwrap().into();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let session_id = session_id.clone();
                std::thread::spawn(move || ledger.freeze(USER, &session_id, play("std")).unwrap())
            })
            .collect();
        let receipts: Vec<SpendReceipt> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(receipts.iter().filter(|r| !r.replayed).count(), 1);
        assert!(receipts.iter().all(|r| r.flow_id == receipts[0].flow_id));
        let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
        assert_eq!((b.available, b.frozen), (900, 100));
        let freezes = ledger
            .list_spend_flows(USER, Some(SpendBizType::Freeze), 1, 50)
            .unwrap();
        assert_eq!(freezes.total, 1);
    }

    #[test]
    fn freeze_racing_end_never_strands_funds() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[("std", 10)]);
        fund(&ledger, USER, 1_000);

        for round in 0..20u64 {
            let session_id: Arc<str> = ledger.start_session(USER, GAME).unwrap().into();
            let freeze = ledger.freeze(USER, &session_id, play("std")).unwrap();

            let ender = {
                let ledger = ledger.clone();
                let session_id = session_id.clone();
                std::thread::spawn(move || {
                    ledger
                        .end_session(USER, GAME, &session_id, freeze.flow_id, Decimal::ONE)
                        .unwrap()
                })
            };
            let again = ledger.freeze(USER, &session_id, play("std"));
            ender.join().unwrap();

            // Either a replay of the original freeze or a rejection, never a new hold
            match again {
                Ok(receipt) => assert_eq!(receipt.flow_id, freeze.flow_id),
                Err(e) => assert!(matches!(e, LedgerError::Validation(_))),
            }
            let b = ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap();
            assert_eq!(b.frozen, 0);
            assert_eq!(b.available, 1_000 - 10 * (round + 1));
        }
    }

    #[test]
    fn end_session_is_idempotent_and_checks_ownership() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[("std", 100)]);
        fund(&ledger, USER, 1_000);
        let session_id = ledger.start_session(USER, GAME).unwrap();
        let freeze = ledger.freeze(USER, &session_id, play("std")).unwrap();

        assert!(matches!(
            ledger.end_session(2, GAME, &session_id, freeze.flow_id, Decimal::ONE),
            Err(LedgerError::NotOwner(_))
        ));
        assert!(matches!(
            ledger.end_session(USER, GAME + 1, &session_id, freeze.flow_id, Decimal::ONE),
            Err(LedgerError::NotOwner(_))
        ));

        let first = ledger
            .end_session(USER, GAME, &session_id, freeze.flow_id, Decimal::ONE)
            .unwrap();
        let again = ledger
            .end_session(USER, GAME, &session_id, freeze.flow_id, Decimal::ONE)
            .unwrap();
        assert!(again.replayed);
        assert_eq!(again.flow_id, first.flow_id);
        assert_eq!(ledger.query_balance(USER, DEFAULT_ASSET_ID).unwrap().frozen, 0);
    }

    #[test]
    fn freeze_of_another_session_is_rejected() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[("std", 100)]);
        fund(&ledger, USER, 1_000);
        let session_id = ledger.start_session(USER, GAME).unwrap();
        let unrelated = ledger.freeze_advanced(USER, "app", 10, "ext", None).unwrap();
        assert!(matches!(
            ledger.end_session(USER, GAME, &session_id, unrelated.flow_id, Decimal::ONE),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn confirm_session_settles_or_audits() {
        let (ledger, _dir) = ledger();
        add_game(&ledger, GameStatus::Active, &[("std", 0)]);

        let mut ended = Vec::new();
        for _ in 0..2 {
            let session_id = ledger.start_session(USER, GAME).unwrap();
            let freeze = ledger.freeze(USER, &session_id, play("std")).unwrap();
            ledger
                .end_session(USER, GAME, &session_id, freeze.flow_id, Decimal::new(15, 0))
                .unwrap();
            ended.push(session_id);
        }

        assert_eq!(
            ledger.confirm_session(USER, &ended[0], Decimal::new(15, 0)).unwrap(),
            SessionStatus::Settled
        );
        assert_eq!(
            ledger.confirm_session(USER, &ended[1], Decimal::new(99, 0)).unwrap(),
            SessionStatus::Auditing
        );
        assert!(matches!(
            ledger.confirm_session(USER, &ended[0], Decimal::new(15, 0)),
            Err(LedgerError::AlreadyProcessed(_))
        ));

        let audited = ledger
            .list_sessions(USER, Some(SessionStatus::Auditing), 1, 50)
            .unwrap();
        assert_eq!(audited.items.len(), 1);
        assert_eq!(audited.items[0].session_id, ended[1]);
    }
}
