//! Scripted query service shared by the integration tests

#![allow(dead_code)]

use rolling_export::error::QueryError;
use rolling_export::etl::{Connector, ResultSet, Session, Timeouts};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub type Reply = Result<ResultSet, QueryError>;

/// Replies are queued per rendered query text; unscripted queries return
/// [`Service::default_rows`] rows.
#[derive(Clone)]
pub struct Service {
    replies: Arc<Mutex<HashMap<String, VecDeque<Reply>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    alive: Arc<AtomicBool>,
    opens: Arc<AtomicU32>,
    default_rows: usize,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            replies: Arc::default(),
            calls: Arc::default(),
            alive: Arc::new(AtomicBool::new(true)),
            opens: Arc::default(),
            default_rows: 2,
        }
    }
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for one rendered query
    pub fn script(&self, query: &str, replies: Vec<Reply>) {
        self.replies
            .lock()
            .unwrap()
            .entry(query.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, query: &str) -> usize {
        self.calls().iter().filter(|q| *q == query).count()
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> ScriptedConnector {
        ScriptedConnector(self.clone())
    }
}

pub fn rows(n: usize) -> ResultSet {
    ResultSet::new(
        vec!["Sales[Id]".to_string(), "Sales[Amount]".to_string()],
        (0..n).map(|i| vec![json!(i), json!(10.0)]).collect(),
    )
}

pub struct ScriptedSession(Service);

impl Session for ScriptedSession {
    async fn ping(&self, _timeouts: &Timeouts) -> bool {
        self.0.alive.load(Ordering::SeqCst)
    }

    async fn query(&self, text: &str, _timeouts: &Timeouts) -> Result<ResultSet, QueryError> {
        self.0.calls.lock().unwrap().push(text.to_string());
        let scripted = self
            .0
            .replies
            .lock()
            .unwrap()
            .get_mut(text)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(rows(self.0.default_rows)))
    }

    async fn close(self) -> Result<(), QueryError> {
        Ok(())
    }
}

pub struct ScriptedConnector(Service);

impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    async fn open(&self, _timeouts: &Timeouts) -> Result<ScriptedSession, QueryError> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        // A fresh session answers probes again
        self.0.alive.store(true, Ordering::SeqCst);
        Ok(ScriptedSession(self.0.clone()))
    }
}
