use std::fmt;

use tokio_postgres::types::ToSql;

/// Owned statement parameter, as queued into a [`Batch`].
pub type BatchParam = Box<dyn ToSql + Sync + Send>;

/// Box a value for [`Batch::queue`].
pub fn param<T: ToSql + Sync + Send + 'static>(value: T) -> BatchParam {
    Box::new(value)
}

pub(crate) struct QueuedStatement {
    pub(crate) sql: String,
    pub(crate) params: Vec<BatchParam>,
}

impl QueuedStatement {
    pub(crate) fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

/// Statements sent together by [`Client::send_batch`](crate::Client::send_batch).
///
/// They run in order on one connection inside a single transaction.
#[derive(Default)]
pub struct Batch {
    statements: Vec<QueuedStatement>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a statement. Returns `self` so calls can be chained.
    pub fn queue(&mut self, sql: impl Into<String>, params: Vec<BatchParam>) -> &mut Self {
        self.statements.push(QueuedStatement {
            sql: sql.into(),
            params,
        });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub(crate) fn statements(&self) -> &[QueuedStatement] {
        &self.statements
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.statements.iter().map(|s| (&s.sql, s.params.len())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keeps_order_and_params() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());
        batch
            .queue("INSERT INTO t (id) VALUES ($1)", vec![param(1_i32)])
            .queue("DELETE FROM t", Vec::new());
        assert_eq!(batch.len(), 2);
        let statements = batch.statements();
        assert_eq!(statements[0].sql, "INSERT INTO t (id) VALUES ($1)");
        assert_eq!(statements[0].param_refs().len(), 1);
        assert!(statements[1].param_refs().is_empty());
    }
}
