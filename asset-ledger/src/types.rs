//! Core types for the asset ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money, integer units for tokens)
//! - Strongly typed identifiers (no mixing of patient and hospital ids)

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Token quantity in whole units
pub type TokenAmount = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get as string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new time-ordered identifier (UUIDv7)
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Storage key bytes
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Authenticated user identifier
    ActorId
);
string_id!(
    /// Patient identifier (equal to the patient's actor id)
    PatientId
);
string_id!(
    /// Hospital identifier
    HospitalId
);
string_id!(
    /// Bank identifier
    BankId
);
string_id!(
    /// Benefit catalog entry identifier (e.g. `CHECKUP`)
    BenefitId
);

uuid_id!(
    /// Deposit identifier, also the AT minting idempotency key
    DepositId
);
uuid_id!(
    /// Trade identifier, also the distribution idempotency key
    TradeId
);
uuid_id!(
    /// Benefit redemption identifier
    RedemptionId
);
uuid_id!(
    /// Caller-chosen key for pool allocations and releases
    AllocationId
);

impl From<&ActorId> for PatientId {
    fn from(actor: &ActorId) -> Self {
        PatientId::new(actor.as_str())
    }
}

/// Platform role, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Asset owner and HT holder
    Patient,
    /// Hospital employee with limited access
    HospitalStaff,
    /// Hospital-scoped administrator
    HospitalAdmin,
    /// Bank-scoped officer (custody and verification)
    BankOfficer,
    /// Platform operator
    SuperAdmin,
}

impl Role {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::HospitalStaff => "hospital_staff",
            Role::HospitalAdmin => "hospital_admin",
            Role::BankOfficer => "bank_officer",
            Role::SuperAdmin => "super_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// User id
    pub id: ActorId,
    /// Role for this session
    pub role: Role,
    /// Hospital the actor is bound to
    pub hospital_id: Option<HospitalId>,
    /// Bank the actor is bound to
    pub bank_id: Option<BankId>,
}

impl Actor {
    /// Patient acting on their own behalf
    pub fn patient(id: impl Into<String>) -> Self {
        Self {
            id: ActorId::new(id),
            role: Role::Patient,
            hospital_id: None,
            bank_id: None,
        }
    }

    /// Hospital staff member
    pub fn hospital_staff(id: impl Into<String>, hospital: HospitalId) -> Self {
        Self {
            id: ActorId::new(id),
            role: Role::HospitalStaff,
            hospital_id: Some(hospital),
            bank_id: None,
        }
    }

    /// Hospital administrator
    pub fn hospital_admin(id: impl Into<String>, hospital: HospitalId) -> Self {
        Self {
            id: ActorId::new(id),
            role: Role::HospitalAdmin,
            hospital_id: Some(hospital),
            bank_id: None,
        }
    }

    /// Bank officer
    pub fn bank_officer(id: impl Into<String>, bank: BankId) -> Self {
        Self {
            id: ActorId::new(id),
            role: Role::BankOfficer,
            hospital_id: None,
            bank_id: Some(bank),
        }
    }

    /// Platform super administrator
    pub fn super_admin(id: impl Into<String>) -> Self {
        Self {
            id: ActorId::new(id),
            role: Role::SuperAdmin,
            hospital_id: None,
            bank_id: None,
        }
    }
}

/// Ledger token kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    /// Asset Token, minted against verified deposits
    AT,
    /// Health Token, minted from trading profit
    HT,
}

impl TokenKind {
    /// Ticker
    pub fn symbol(&self) -> &'static str {
        match self {
            TokenKind::AT => "AT",
            TokenKind::HT => "HT",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Kind of physical asset deposited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetType {
    /// Gold bullion or jewellery
    Gold,
    /// Silver
    Silver,
    /// Cash
    Cash,
    /// Land or buildings
    RealEstate,
    /// Anything else, by name
    Other(String),
}

/// Outcome of an idempotent operation
///
/// A replay is not a failure: callers retrying after a timeout get the
/// original result back as `AlreadyProcessed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed<T> {
    /// Effect applied by this call
    Applied(T),
    /// Effect applied earlier; carries the original result
    AlreadyProcessed(T),
}

impl<T> Processed<T> {
    /// Result regardless of which call applied it
    pub fn into_inner(self) -> T {
        match self {
            Processed::Applied(value) | Processed::AlreadyProcessed(value) => value,
        }
    }

    /// Borrow the result
    pub fn get(&self) -> &T {
        match self {
            Processed::Applied(value) | Processed::AlreadyProcessed(value) => value,
        }
    }

    /// Whether this call applied the effect
    pub fn is_applied(&self) -> bool {
        matches!(self, Processed::Applied(_))
    }

    /// Map the carried value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Processed<U> {
        match self {
            Processed::Applied(value) => Processed::Applied(f(value)),
            Processed::AlreadyProcessed(value) => Processed::AlreadyProcessed(f(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patient_id_from_actor() {
        let actor = Actor::patient("p-1");
        assert_eq!(PatientId::from(&actor.id), PatientId::new("p-1"));
    }

    #[test]
    fn test_processed_into_inner() {
        assert_eq!(Processed::Applied(5u64).into_inner(), 5);
        assert_eq!(Processed::AlreadyProcessed(5u64).into_inner(), 5);
        assert!(Processed::Applied(1u8).is_applied());
        assert!(!Processed::AlreadyProcessed(1u8).map(|v| v + 1).is_applied());
    }
}
