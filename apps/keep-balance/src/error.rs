#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("current user ({0}) is not an active admin user")]
    NotAdmin(String),
    #[error("config error: {0}: proxy servers cannot be balanced")]
    ProxyService(String),
    #[error("{0} collections exist with null modified_at; cannot fetch reliably")]
    NullModifiedAt(i64),
    #[error("received zero collections")]
    ZeroCollections,
    #[error("zero blocks have desired replication>0")]
    NothingDesired,
    #[error("Default replication ({0}) is less than 1")]
    DefaultReplication(i64),
    #[error("cannot proceed safely after {0} deferred errors")]
    DeferredErrors(usize),
    #[error("collection {0} has no modified_at timestamp; cannot make progress")]
    MissingModifiedAt(String),
    #[error("received an entire page with the same modified_at timestamp ({0}); cannot make progress")]
    NoProgress(String),
    #[error("retrieved {got} collections with modified_at <= {until}, but server now reports there are {want}")]
    MissedCollections { got: usize, want: i64, until: String },
}
