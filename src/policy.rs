//! Circulation policy: per-school library settings, fine arithmetic, renewal
//! eligibility and the reservation state machine.
//!
//! Everything here is pure; handlers load rows, call into this module and
//! persist whatever it decides.

use chrono::{Days, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    Student,
    Teacher,
    Staff,
}

impl MemberType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Self::Student),
            "teacher" => Some(Self::Teacher),
            "staff" => Some(Self::Staff),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Staff => "staff",
        }
    }

    /// Kind of person record a member of this type links to.
    pub fn person_kind(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher | Self::Staff => "staff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Issued,
    Returned,
    Overdue,
}

impl TransactionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issued" => Some(Self::Issued),
            "returned" => Some(Self::Returned),
            "overdue" => Some(Self::Overdue),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Returned => "returned",
            Self::Overdue => "overdue",
        }
    }

    /// Still counts against the member's borrowing limit.
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Returned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Available,
    Fulfilled,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "available" => Some(Self::Available),
            "fulfilled" => Some(Self::Fulfilled),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Available => "available",
            Self::Fulfilled => "fulfilled",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Available)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Available)
                | (Pending, Cancelled)
                | (Available, Fulfilled)
                | (Available, Expired)
                | (Available, Cancelled)
        )
    }
}

/// Rule violations raised by circulation operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CirculationError {
    #[error("no copies of this book are on the shelf")]
    NoCopiesAvailable,

    #[error("every shelf copy is held for another member's reservation")]
    ReservedForAnotherMember,

    #[error("member already has {current} open loans (limit {limit})")]
    BorrowingLimitReached { limit: i64, current: i64 },

    #[error("member is not active")]
    MemberInactive,

    #[error("maximum renewals exceeded ({max})")]
    MaxRenewalsExceeded { max: i64 },

    #[error("transaction was already returned")]
    AlreadyReturned,

    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("member already has an active reservation for this book")]
    DuplicateReservation,

    #[error("member currently has this book on loan")]
    AlreadyBorrowed,

    #[error("{on_loan} copies are on loan; total copies cannot go below that")]
    CopiesOnLoan { on_loan: i64 },

    #[error("{held} shelf copies are held for reservations; total copies cannot drop below {floor}")]
    CopiesHeld { held: i64, floor: i64 },

    #[error("no outstanding fine on this transaction")]
    NoFineDue,
}

impl CirculationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoCopiesAvailable => "no_copies_available",
            Self::ReservedForAnotherMember => "reserved_for_another_member",
            Self::BorrowingLimitReached { .. } => "borrowing_limit_reached",
            Self::MemberInactive => "member_inactive",
            Self::MaxRenewalsExceeded { .. } => "max_renewals_exceeded",
            Self::AlreadyReturned => "already_returned",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::DuplicateReservation => "duplicate_reservation",
            Self::AlreadyBorrowed => "already_borrowed",
            Self::CopiesOnLoan { .. } => "copies_on_loan",
            Self::CopiesHeld { .. } => "copies_held",
            Self::NoFineDue => "no_fine_due",
        }
    }
}

/// Per-school circulation policy. Missing settings fall back to `Default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibrarySettings {
    pub fine_per_day: Decimal,
    pub grace_period_days: i64,
    pub max_fine_amount: Decimal,
    pub student_borrowing_limit: i64,
    pub teacher_borrowing_limit: i64,
    pub staff_borrowing_limit: i64,
    pub student_borrowing_days: i64,
    pub teacher_borrowing_days: i64,
    pub staff_borrowing_days: i64,
    pub max_renewals: i64,
    pub reservation_hold_days: i64,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            fine_per_day: Decimal::new(50, 2),
            grace_period_days: 0,
            max_fine_amount: Decimal::new(2500, 2),
            student_borrowing_limit: 3,
            teacher_borrowing_limit: 5,
            staff_borrowing_limit: 3,
            student_borrowing_days: 14,
            teacher_borrowing_days: 30,
            staff_borrowing_days: 21,
            max_renewals: 2,
            reservation_hold_days: 3,
        }
    }
}

impl LibrarySettings {
    pub fn borrowing_limit(&self, member_type: MemberType) -> i64 {
        match member_type {
            MemberType::Student => self.student_borrowing_limit,
            MemberType::Teacher => self.teacher_borrowing_limit,
            MemberType::Staff => self.staff_borrowing_limit,
        }
    }

    pub fn borrowing_days(&self, member_type: MemberType) -> i64 {
        match member_type {
            MemberType::Student => self.student_borrowing_days,
            MemberType::Teacher => self.teacher_borrowing_days,
            MemberType::Staff => self.staff_borrowing_days,
        }
    }

    /// Build settings from a stored JSON object. Fields that fail validation
    /// keep their default so an old or hand-edited row never blocks reads.
    pub fn from_stored(saved: &Map<String, Value>) -> Self {
        let mut settings = Self::default();
        for (k, v) in saved {
            let _ = settings.apply_field(k, v);
        }
        settings
    }

    /// Apply a patch atomically: either every field is valid and applied, or
    /// `self` is left untouched.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = self.clone();
        for (k, v) in patch {
            next.apply_field(k, v)?;
        }
        *self = next;
        Ok(())
    }

    fn apply_field(&mut self, key: &str, v: &Value) -> Result<(), String> {
        match key {
            "finePerDay" => self.fine_per_day = parse_money(v, key)?,
            "maxFineAmount" => self.max_fine_amount = parse_money(v, key)?,
            "gracePeriodDays" => self.grace_period_days = parse_i64_range(v, key, 0, 60)?,
            "studentBorrowingLimit" => {
                self.student_borrowing_limit = parse_i64_range(v, key, 0, 50)?
            }
            "teacherBorrowingLimit" => {
                self.teacher_borrowing_limit = parse_i64_range(v, key, 0, 50)?
            }
            "staffBorrowingLimit" => self.staff_borrowing_limit = parse_i64_range(v, key, 0, 50)?,
            "studentBorrowingDays" => {
                self.student_borrowing_days = parse_i64_range(v, key, 1, 365)?
            }
            "teacherBorrowingDays" => {
                self.teacher_borrowing_days = parse_i64_range(v, key, 1, 365)?
            }
            "staffBorrowingDays" => self.staff_borrowing_days = parse_i64_range(v, key, 1, 365)?,
            "maxRenewals" => self.max_renewals = parse_i64_range(v, key, 0, 10)?,
            "reservationHoldDays" => {
                self.reservation_hold_days = parse_i64_range(v, key, 1, 60)?
            }
            _ => return Err(format!("unknown library settings field: {}", key)),
        }
        Ok(())
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

/// Decimal from a JSON number or decimal string, sign unchecked.
pub fn parse_decimal(v: &Value, key: &str) -> Result<Decimal, String> {
    let parsed = if let Some(s) = v.as_str() {
        Decimal::from_str(s.trim()).ok()
    } else if let Some(n) = v.as_i64() {
        Some(Decimal::from(n))
    } else if let Some(f) = v.as_f64() {
        Decimal::from_str(&f.to_string()).ok()
    } else {
        None
    };
    parsed.ok_or_else(|| format!("{} must be a decimal amount", key))
}

/// Non-negative currency amount with at most two decimal places. Accepts
/// JSON numbers or decimal strings.
pub fn parse_money(v: &Value, key: &str) -> Result<Decimal, String> {
    let d = parse_decimal(v, key)?;
    if d.is_sign_negative() && !d.is_zero() {
        return Err(format!("{} must not be negative", key));
    }
    if d.normalize().scale() > 2 {
        return Err(format!("{} must have at most 2 decimal places", key));
    }
    Ok(d)
}

pub fn add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    if days >= 0 {
        date.checked_add_days(Days::new(days as u64))
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
    }
}

/// Whole days past the due date, zero when returned on time.
pub fn days_late(due: NaiveDate, returned: NaiveDate) -> i64 {
    (returned - due).num_days().max(0)
}

/// Fine for a return: days beyond the grace period times the daily rate,
/// capped at the configured maximum.
pub fn compute_fine(settings: &LibrarySettings, due: NaiveDate, returned: NaiveDate) -> Decimal {
    let chargeable = days_late(due, returned) - settings.grace_period_days;
    if chargeable <= 0 {
        return Decimal::ZERO;
    }
    let fine = (settings.fine_per_day * Decimal::from(chargeable))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    fine.min(settings.max_fine_amount)
}

pub fn check_renewal(renewal_count: i64, max_renewals: i64) -> Result<(), CirculationError> {
    if renewal_count >= max_renewals {
        return Err(CirculationError::MaxRenewalsExceeded { max: max_renewals });
    }
    Ok(())
}

pub fn check_transition(
    from: ReservationStatus,
    to: ReservationStatus,
) -> Result<(), CirculationError> {
    if !from.can_transition_to(to) {
        return Err(CirculationError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        });
    }
    Ok(())
}

/// Outcome of checking whether a member may take a copy off the shelf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShelfDecision {
    /// An unheld copy is free.
    Free,
    /// The member takes the copy held for their own reservation.
    OwnHold,
}

/// `held` counts reservations of the book currently in `available` status;
/// each pins one shelf copy.
pub fn check_shelf(
    available_copies: i64,
    held: i64,
    member_has_hold: bool,
) -> Result<ShelfDecision, CirculationError> {
    if member_has_hold && available_copies > 0 {
        return Ok(ShelfDecision::OwnHold);
    }
    if available_copies <= 0 {
        return Err(CirculationError::NoCopiesAvailable);
    }
    if available_copies - held <= 0 {
        return Err(CirculationError::ReservedForAnotherMember);
    }
    Ok(ShelfDecision::Free)
}

pub fn check_borrowing_limit(open_loans: i64, limit: i64) -> Result<(), CirculationError> {
    if open_loans >= limit {
        return Err(CirculationError::BorrowingLimitReached {
            limit,
            current: open_loans,
        });
    }
    Ok(())
}
