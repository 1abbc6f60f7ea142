//! Query builder for stored readings.
//!
//! # Example
//!
//! ```
//! use ambisync_store::{ReadingQuery, Store};
//!
//! let store = Store::open_in_memory()?;
//!
//! // Readings of one device in (from, to], newest first
//! let query = ReadingQuery::new()
//!     .device("AA:BB:CC:DD:EE:FF")
//!     .after(1_700_000_000_000)
//!     .until(1_700_086_400_000);
//!
//! let readings = store.query_readings(&query)?;
//! assert!(readings.is_empty());
//! # Ok::<(), ambisync_store::Error>(())
//! ```

/// Filters for [`Store::query_readings`](crate::Store::query_readings).
///
/// Time bounds are epoch milliseconds. The lower bound is exclusive and the
/// upper bound inclusive, so consecutive windows never overlap.
///
/// By default, queries return results ordered by `epoch_millis` descending
/// (newest first).
#[derive(Debug, Default, Clone)]
pub struct ReadingQuery {
    pub device_id: Option<String>,
    /// Only readings strictly after this timestamp.
    pub after_millis: Option<i64>,
    /// Only readings at or before this timestamp.
    pub until_millis: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Order by epoch_millis descending (newest first).
    pub newest_first: bool,
}

impl ReadingQuery {
    /// Every reading of every device, newest first.
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    /// Restrict to one device.
    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    /// Only include readings strictly newer than `millis`.
    pub fn after(mut self, millis: i64) -> Self {
        self.after_millis = Some(millis);
        self
    }

    /// Only include readings at or before `millis`.
    pub fn until(mut self, millis: i64) -> Self {
        self.until_millis = Some(millis);
        self
    }

    /// Return at most `limit` readings.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` matching readings.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Order results by oldest first (ascending by `epoch_millis`).
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// `WHERE` clause with its bound parameters, in placeholder order.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut filters: Vec<(&str, Box<dyn rusqlite::ToSql>)> = Vec::new();

        if let Some(device_id) = &self.device_id {
            filters.push(("device_id = ?", Box::new(device_id.clone())));
        }
        if let Some(after) = self.after_millis {
            filters.push(("epoch_millis > ?", Box::new(after)));
        }
        if let Some(until) = self.until_millis {
            filters.push(("epoch_millis <= ?", Box::new(until)));
        }

        if filters.is_empty() {
            return (String::new(), Vec::new());
        }

        let (conditions, params): (Vec<&str>, Vec<_>) = filters.into_iter().unzip();
        (format!("WHERE {}", conditions.join(" AND ")), params)
    }

    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT device_id, epoch_millis, device_info, payload \
             FROM readings {} ORDER BY epoch_millis {}",
            where_clause, order
        );

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = self.offset {
            // SQLite requires a LIMIT before OFFSET
            if self.limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_query() {
        let query = ReadingQuery::new();
        assert!(query.newest_first);
        let sql = query.build_sql();
        assert!(!sql.contains("WHERE"));
        assert!(sql.ends_with("ORDER BY epoch_millis DESC"));
    }

    #[test]
    fn test_range_query_sql() {
        let query = ReadingQuery::new().device("dev").after(10).until(20);
        let (where_clause, params) = query.build_where();
        assert_eq!(
            where_clause,
            "WHERE device_id = ? AND epoch_millis > ? AND epoch_millis <= ?"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_pagination_sql() {
        let sql = ReadingQuery::new().limit(5).offset(10).oldest_first().build_sql();
        assert!(sql.contains("ORDER BY epoch_millis ASC LIMIT 5 OFFSET 10"));

        let sql = ReadingQuery::new().offset(10).build_sql();
        assert!(sql.contains("LIMIT -1 OFFSET 10"));
    }
}
