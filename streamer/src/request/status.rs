//! Request status, priority and deadline types.

use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle status of a request.
///
/// Status only ever moves forward: `Pending → Queued → Processing →
/// {Completed | Failed | Canceled}`. The three terminal states share a rank,
/// so once a request is terminal its status never changes again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Built but not yet seen by the scheduler.
    #[default]
    Pending,
    /// In the scheduler's ordered queue with a pending id.
    Queued,
    /// Claimed by a stack node or waiting on child requests.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Canceled before any result was produced.
    Canceled,
}

impl RequestStatus {
    /// Returns true for Completed, Failed and Canceled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Returns true if the request finished successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Queued => 1,
            Self::Processing => 2,
            Self::Completed | Self::Failed | Self::Canceled => 3,
        }
    }

    /// Returns true if moving from `self` to `next` does not regress.
    ///
    /// Re-entering the same non-terminal state is allowed; leaving a terminal
    /// state is not.
    pub fn can_advance_to(&self, next: RequestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Queued => write!(f, "Queued"),
            Self::Processing => write!(f, "Processing"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Request priority. Higher values are served first among requests that
/// share a deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const BELOW_NORMAL: Priority = Priority(64);
    pub const MEDIUM: Priority = Priority(128);
    pub const ABOVE_NORMAL: Priority = Priority(160);
    pub const HIGH: Priority = Priority(192);
    pub const HIGHEST: Priority = Priority(255);
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling deadline. Advisory only: it orders work but never aborts it.
///
/// [`Deadline::NONE`] sorts after every concrete deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; served after all requests that have one.
    pub const NONE: Deadline = Deadline(None);

    /// A deadline at the given instant.
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// A deadline `duration` from now.
    pub fn in_(duration: Duration) -> Self {
        Self(Instant::now().checked_add(duration))
    }

    /// A deadline that has already passed; served as soon as possible.
    pub fn immediate() -> Self {
        Self(Some(Instant::now()))
    }

    /// Returns the deadline instant, if any.
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_terminal() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Queued.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_status_never_regresses() {
        assert!(RequestStatus::Pending.can_advance_to(RequestStatus::Queued));
        assert!(RequestStatus::Queued.can_advance_to(RequestStatus::Canceled));
        assert!(RequestStatus::Processing.can_advance_to(RequestStatus::Processing));
        assert!(!RequestStatus::Processing.can_advance_to(RequestStatus::Queued));
        assert!(!RequestStatus::Completed.can_advance_to(RequestStatus::Failed));
        assert!(!RequestStatus::Canceled.can_advance_to(RequestStatus::Canceled));
    }

    #[test]
    fn test_deadline_none_sorts_last() {
        let soon = Deadline::in_(Duration::from_millis(5));
        let later = Deadline::in_(Duration::from_secs(5));
        assert!(soon < later);
        assert!(later < Deadline::NONE);
        assert_eq!(Deadline::NONE.cmp(&Deadline::NONE), Ordering::Equal);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::HIGHEST > Priority::HIGH);
        assert!(Priority::MEDIUM > Priority::LOWEST);
        assert_eq!(Priority::default(), Priority::MEDIUM);
    }
}
