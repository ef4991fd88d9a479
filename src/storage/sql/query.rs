//! SQL database abstraction trait.

/// Trait for SQL database backends.
///
/// This trait abstracts over different SQL databases (PostgreSQL, SQLite)
/// by providing the pool type and query building methods.
pub trait SqlDatabase: Send + Sync + 'static {
    /// The connection pool type for this database.
    type Pool: Clone + Send + Sync;

    fn build_select(stmt: sea_query::SelectStatement) -> String;

    fn build_insert(stmt: sea_query::InsertStatement) -> String;

    fn build_update(stmt: sea_query::UpdateStatement) -> String;

    fn build_table(stmt: sea_query::TableCreateStatement) -> String;

    fn build_index(stmt: sea_query::IndexCreateStatement) -> String;
}
