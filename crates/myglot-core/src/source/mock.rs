//! In-memory mock SQL source for testing collectors without a live server.
//!
//! Responses are selected by rules: the first rule whose SQL fragment occurs
//! in the statement (and whose parameter filter, if any, matches) wins.
//! Unmatched reads return no rows; unmatched writes affect zero rows.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Connector, DbError, SqlParam, SqlRow, SqlSource};

#[derive(Debug, Clone)]
enum Response {
    Rows(Vec<SqlRow>),
    Affected(u64),
    Fail(DbError),
}

#[derive(Debug, Clone)]
struct Rule {
    fragment: String,
    param: Option<SqlParam>,
    delay: Option<Duration>,
    response: Response,
}

impl Rule {
    fn matches(&self, sql: &str, params: &[SqlParam]) -> bool {
        sql.contains(&self.fragment)
            && self
                .param
                .as_ref()
                .is_none_or(|p| params.iter().any(|candidate| candidate == p))
    }
}

/// A statement the mock received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub sql: String,
    pub params: Vec<SqlParam>,
    /// Database the issuing source was scoped to.
    pub database: Option<String>,
}

#[derive(Debug, Default)]
struct Shared {
    rules: Vec<Rule>,
    calls: Vec<RecordedCall>,
    closed: usize,
}

/// Rule-driven [`SqlSource`]. Clones share rules and the call log.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    shared: Arc<Mutex<Shared>>,
    database: Option<String>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_rule(&self, rule: Rule) {
        self.shared.lock().unwrap().rules.push(rule);
    }

    /// Returns `rows` for statements containing `fragment`.
    pub fn on(self, fragment: &str, rows: Vec<SqlRow>) -> Self {
        self.add_rule(Rule {
            fragment: fragment.to_string(),
            param: None,
            delay: None,
            response: Response::Rows(rows),
        });
        self
    }

    /// Returns `rows` for statements containing `fragment` bound with `param`.
    pub fn on_param(self, fragment: &str, param: impl Into<SqlParam>, rows: Vec<SqlRow>) -> Self {
        self.add_rule(Rule {
            fragment: fragment.to_string(),
            param: Some(param.into()),
            delay: None,
            response: Response::Rows(rows),
        });
        self
    }

    /// Reports `affected` rows for writes containing `fragment`.
    pub fn on_execute(self, fragment: &str, affected: u64) -> Self {
        self.add_rule(Rule {
            fragment: fragment.to_string(),
            param: None,
            delay: None,
            response: Response::Affected(affected),
        });
        self
    }

    /// Fails statements containing `fragment`.
    pub fn fail_on(self, fragment: &str, error: DbError) -> Self {
        self.add_rule(Rule {
            fragment: fragment.to_string(),
            param: None,
            delay: None,
            response: Response::Fail(error),
        });
        self
    }

    /// Fails statements containing `fragment` bound with `param`.
    pub fn fail_on_param(self, fragment: &str, param: impl Into<SqlParam>, error: DbError) -> Self {
        self.add_rule(Rule {
            fragment: fragment.to_string(),
            param: Some(param.into()),
            delay: None,
            response: Response::Fail(error),
        });
        self
    }

    /// Answers statements containing `fragment` with `rows` after `delay`.
    pub fn delay_on(self, fragment: &str, delay: Duration, rows: Vec<SqlRow>) -> Self {
        self.add_rule(Rule {
            fragment: fragment.to_string(),
            param: None,
            delay: Some(delay),
            response: Response::Rows(rows),
        });
        self
    }

    /// A clone scoped to `database`; shares rules and call log.
    pub fn scoped(&self, database: Option<&str>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            database: database.map(str::to_string),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared.lock().unwrap().calls.clone()
    }

    /// Calls whose SQL contains `fragment`.
    pub fn calls_matching(&self, fragment: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.sql.contains(fragment))
            .collect()
    }

    pub fn closed_count(&self) -> usize {
        self.shared.lock().unwrap().closed
    }

    async fn respond(&self, sql: &str, params: &[SqlParam]) -> Response {
        let rule = {
            let mut shared = self.shared.lock().unwrap();
            shared.calls.push(RecordedCall {
                sql: sql.to_string(),
                params: params.to_vec(),
                database: self.database.clone(),
            });
            shared
                .rules
                .iter()
                .find(|r| r.matches(sql, params))
                .cloned()
        };

        let Some(rule) = rule else {
            return Response::Rows(Vec::new());
        };
        if let Some(delay) = rule.delay {
            tokio::time::sleep(delay).await;
        }
        rule.response
    }
}

#[async_trait]
impl SqlSource for MockSource {
    async fn fetch_all(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>, DbError> {
        match self.respond(sql, params).await {
            Response::Rows(rows) => Ok(rows),
            Response::Affected(_) => Ok(Vec::new()),
            Response::Fail(e) => Err(e),
        }
    }

    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError> {
        match self.respond(sql, params).await {
            Response::Rows(rows) => Ok(rows.len() as u64),
            Response::Affected(n) => Ok(n),
            Response::Fail(e) => Err(e),
        }
    }

    async fn close(&self) {
        self.shared.lock().unwrap().closed += 1;
    }
}

/// [`Connector`] handing out scoped clones of one [`MockSource`].
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    source: MockSource,
    refuse: Arc<Mutex<Vec<Option<String>>>>,
    connects: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockConnector {
    pub fn new(source: MockSource) -> Self {
        Self {
            source,
            refuse: Arc::default(),
            connects: Arc::default(),
        }
    }

    /// Refuses connections to `database` (`None` = the default connection).
    pub fn refuse(self, database: Option<&str>) -> Self {
        self.refuse
            .lock()
            .unwrap()
            .push(database.map(str::to_string));
        self
    }

    pub fn source(&self) -> &MockSource {
        &self.source
    }

    /// Databases passed to every successful `connect`, in order.
    pub fn connects(&self) -> Vec<Option<String>> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Source = MockSource;

    async fn connect(&self, database: Option<&str>) -> Result<MockSource, DbError> {
        let wanted = database.map(str::to_string);
        if self.refuse.lock().unwrap().contains(&wanted) {
            return Err(DbError::Connect(format!(
                "connection refused ({})",
                database.unwrap_or("default")
            )));
        }
        self.connects.lock().unwrap().push(wanted);
        Ok(self.source.scoped(database))
    }
}
