use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors possible to occur during reconciliation
#[derive(Error, Debug)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    /// A create-or-update transaction failed to commit
    #[error("commit error: {0}")]
    CommitError(#[from] kube::api::entry::CommitError),

    /// Error in user input or Someapp resource definition that admission did not catch
    #[error("invalid Someapp: {0}")]
    InvalidSomeapp(String),

    /// Canary reconcile found no stable route entry to splice against
    #[error("VirtualService `{0}` has no stable route entry")]
    MissingStableRoute(String),

    /// Trace id was requested outside of a sampled span
    #[error("invalid trace id")]
    InvalidTraceId,
}

impl Error {
    /// Stable, payload-free label for failure metrics.
    pub fn metric_label(&self) -> String {
        let dbg = format!("{self:?}");
        dbg.split(['(', ' ', '{'])
            .next()
            .unwrap_or("unknown")
            .to_lowercase()
    }
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn metric_label_strips_payload() {
        let e = Error::InvalidSomeapp("no container named app".to_string());
        assert_eq!(e.metric_label(), "invalidsomeapp");
        let e = Error::MissingStableRoute("web".to_string());
        assert_eq!(e.metric_label(), "missingstableroute");
    }
}
