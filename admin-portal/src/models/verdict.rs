use super::identity::Identity;

/// The reconciler's authorization decision for one mounted guard.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Pending,
    Authorized(Identity),
    Unauthorized,
}

impl Verdict {
    pub fn is_pending(&self) -> bool {
        matches!(self, Verdict::Pending)
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self, Verdict::Authorized(_))
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Verdict::Authorized(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pending => "pending",
            Verdict::Authorized(_) => "authorized",
            Verdict::Unauthorized => "unauthorized",
        }
    }
}

/// Why a run ended in `Unauthorized`. Logged and counted, never shown to
/// the visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    NoIdentity,
    NotListed,
    Inactive,
    Ambiguous,
    SignedOut,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::NoIdentity => "no_identity",
            DenialReason::NotListed => "not_listed",
            DenialReason::Inactive => "inactive",
            DenialReason::Ambiguous => "ambiguous",
            DenialReason::SignedOut => "signed_out",
        }
    }

    /// Authoritative denials invalidate the cached identity.
    pub fn clears_cache(&self) -> bool {
        matches!(
            self,
            DenialReason::NotListed | DenialReason::Inactive | DenialReason::SignedOut
        )
    }
}
