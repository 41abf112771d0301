//! Shared helpers for unit tests: an in-memory progress store and scripted
//! stand-ins for the chat completions endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Mutex;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::model::progress::ProgressCtrl;
use crate::model::voter::{VoterDetails, VoterRecord};
use crate::prompt::azure::{ChatApiResponse, ChatChoice, ChatMessage, CompletionApi, PromptUsage};

/// Tests that pause the tokio clock must connect first: under a paused clock
/// the pool's acquire timeout fires instantly while the sqlite handshake runs
/// on its background thread. Call this, then `tokio::time::pause()`.
pub async fn setup_progress_db() -> DatabaseConnection {
    // A single pooled connection, otherwise every pool member gets its own
    // private in-memory database. The acquire-time ping is off so later
    // acquires complete without parking on a timer once the clock is paused.
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .test_before_acquire(false)
        .sqlx_logging(false);

    let conn = Database::connect(options)
        .await
        .expect("in-memory sqlite should connect");
    ProgressCtrl::init_schema(&conn)
        .await
        .expect("schema init should succeed");

    // Releasing a pooled connection pings sqlite on its background OS thread.
    // Under a paused clock the runtime looks idle while that reply is in
    // flight, so tokio auto-advances straight to the pool's acquire timeout
    // and the next query fails with ConnectionAcquire(Timeout). This ticker
    // pins every auto-advance step to 1ms, and the yield batch keeps the
    // runtime busy long enough per step for the worker thread to answer, so
    // a DB round trip costs only a few virtual milliseconds.
    tokio::spawn(async {
        loop {
            for _ in 0..256 {
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    });

    conn
}

pub fn voters(n: usize) -> Vec<VoterDetails> {
    (0..n)
        .map(|i| VoterDetails {
            name: format!("Voter {i}"),
            guardian: format!("Guardian {i}"),
            house: format!("House {i}"),
        })
        .collect()
}

pub fn voter_records(n: usize) -> Vec<VoterRecord> {
    voters(n)
        .into_iter()
        .enumerate()
        .map(|(i, details)| VoterRecord {
            row_index: i as i64,
            details,
        })
        .collect()
}

pub fn chat_response(content: &str) -> ChatApiResponse {
    ChatApiResponse {
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: content.to_string(),
            },
        }],
        usage: PromptUsage {
            prompt_tokens: 50,
            completion_tokens: 50,
            total_tokens: 100,
        },
    }
}

pub fn predictions_response(predictions: &[(usize, &str)]) -> ChatApiResponse {
    let predictions: Vec<serde_json::Value> = predictions
        .iter()
        .map(|(index, religion)| json!({ "index": index, "religion": religion }))
        .collect();
    chat_response(&json!({ "predictions": predictions }).to_string())
}

/// Replays a fixed list of outcomes, then times out for any further call.
pub struct ScriptedApi {
    responses: Mutex<VecDeque<AppResult<ChatApiResponse>>>,
    calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn new(responses: Vec<AppResult<ChatApiResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Relaxed)
    }
}

impl CompletionApi for ScriptedApi {
    async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> AppResult<ChatApiResponse> {
        self.calls.fetch_add(1, Relaxed);
        match self.responses.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Err(AppError::RequestTimeout),
        }
    }
}

/// Answers every batch with the same label for each submitted position,
/// inferring the batch size from the indexed prompt lines. Clones share the
/// call counter so a caller can keep a handle for assertions.
#[derive(Clone)]
pub struct EchoApi {
    label: &'static str,
    calls: std::sync::Arc<AtomicUsize>,
}

impl EchoApi {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            calls: std::sync::Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Relaxed)
    }
}

impl CompletionApi for EchoApi {
    async fn complete(&self, _system_prompt: &str, user_prompt: &str) -> AppResult<ChatApiResponse> {
        self.calls.fetch_add(1, Relaxed);
        let batch_len = user_prompt
            .lines()
            .filter(|line| line.contains(". Name: "))
            .count();
        let predictions: Vec<(usize, &str)> = (0..batch_len).map(|i| (i, self.label)).collect();
        Ok(predictions_response(&predictions))
    }
}
