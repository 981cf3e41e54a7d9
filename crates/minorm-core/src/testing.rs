//! Recording driver for unit tests.

use crate::driver::{Driver, DriverResult};
use crate::error::{ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result};
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockFailure {
    Commit,
    Rollback,
    Execute(QueryErrorKind),
}

#[derive(Debug, Default)]
struct MockState {
    log: Vec<String>,
    params: Vec<Vec<Value>>,
    failures: VecDeque<MockFailure>,
    results: VecDeque<DriverResult>,
    next_id: i64,
    hold_next: bool,
    native_returning: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_native_returning(self) -> Self {
        self.state.lock().unwrap().native_returning = true;
        self
    }

    pub(crate) fn fail_next(&self, failure: MockFailure) {
        self.state.lock().unwrap().failures.push_back(failure);
    }

    pub(crate) fn push_result(&self, result: DriverResult) {
        self.state.lock().unwrap().results.push_back(result);
    }

    pub(crate) fn hold_next_execute(&self) {
        self.state.lock().unwrap().hold_next = true;
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub(crate) fn params(&self) -> Vec<Vec<Value>> {
        self.state.lock().unwrap().params.clone()
    }

    fn take_failure(&self, want: MockFailure) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.failures.front() == Some(&want) {
            state.failures.pop_front();
            true
        } else {
            false
        }
    }

    fn record(&self, entry: &str) {
        self.state.lock().unwrap().log.push(entry.to_string());
    }
}

fn disconnected() -> Error {
    Error::connection(ConnectionErrorKind::Disconnected, "mock driver failure")
}

impl Driver for MockDriver {
    type Config = ();

    async fn open(_config: &()) -> Result<Self> {
        Ok(Self::new())
    }

    fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl std::future::Future<Output = Result<DriverResult>> + Send {
        let this = self.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let hold = std::mem::take(&mut this.state.lock().unwrap().hold_next);
            if hold {
                std::future::pending::<()>().await;
            }
            this.record(&sql);
            let mut state = this.state.lock().unwrap();
            state.params.push(params);
            if let Some(MockFailure::Execute(kind)) = state.failures.front().copied() {
                state.failures.pop_front();
                return Err(Error::Query(QueryError {
                    kind,
                    message: "mock statement failure".to_string(),
                    code: None,
                    sql: Some(sql),
                    context: None,
                    source: None,
                }));
            }
            if let Some(result) = state.results.pop_front() {
                return Ok(result);
            }
            state.next_id += 1;
            Ok(DriverResult {
                affected: 1,
                last_insert_id: Some(state.next_id),
                ..DriverResult::default()
            })
        }
    }

    async fn begin(&self) -> Result<()> {
        self.record("BEGIN");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.record("COMMIT");
        if self.take_failure(MockFailure::Commit) {
            return Err(disconnected());
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record("ROLLBACK");
        if self.take_failure(MockFailure::Rollback) {
            return Err(disconnected());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("CLOSE");
        Ok(())
    }

    fn native_returning(&self) -> bool {
        self.state.lock().unwrap().native_returning
    }
}
