//! Role/scope permission model
//!
//! `authorize(actor, permission, scope)` is a pure function of an
//! immutable [`PermissionTable`] injected at construction. Each role maps
//! to a fixed permission set; each permission carries a scope rule that
//! binds it to the actor's hospital, bank or own patient id.
//! `SuperAdmin` skips the scope rule but never the permission set.

use crate::types::{Actor, BankId, HospitalId, PatientId, Role};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Enumerated permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Submit a physical-asset deposit
    SubmitDeposit,
    /// Approve or reject a pending deposit
    ApproveDeposit,
    /// Mint AT for an approved deposit
    #[serde(rename = "mint_at")]
    MintAT,
    /// Move own AT into or out of a hospital trading pool
    #[serde(rename = "allocate_at")]
    AllocateAT,
    /// Record a trading outcome
    RecordTrade,
    /// Distribute trade profit as HT
    DistributeProfit,
    /// Redeem own HT for a benefit
    #[serde(rename = "redeem_ht")]
    RedeemHT,
    /// View own profile
    ViewOwnProfile,
    /// View own balances and deposits
    ViewOwnAssets,
    /// View own token transactions
    ViewOwnTransactions,
    /// View own hospital
    ViewOwnHospital,
    /// View patients of own hospital
    ViewHospitalPatients,
    /// View deposits and pool of own hospital
    ViewHospitalAssets,
    /// View token transactions of own hospital
    ViewHospitalTransactions,
    /// View audit log of own hospital
    ViewHospitalAuditLogs,
    /// View own bank
    ViewOwnBank,
    /// View transactions of own bank
    ViewBankTransactions,
    /// View every patient
    ViewAllPatients,
    /// View every deposit and balance
    ViewAllAssets,
    /// View every token transaction
    ViewAllTransactions,
    /// View the full audit log
    ViewAllAuditLogs,
}

/// Which part of the scope a permission is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRule {
    /// System-wide, no scope check
    System,
    /// Actor's hospital must equal scope hospital
    Hospital,
    /// Actor's bank must equal scope bank
    Bank,
    /// Either hospital or bank must match
    HospitalOrBank,
    /// Actor id must equal scope patient
    Patient,
}

impl Permission {
    /// Scope rule for this permission
    pub fn scope_rule(&self) -> ScopeRule {
        use Permission::*;
        match self {
            SubmitDeposit | AllocateAT | RedeemHT | ViewOwnProfile | ViewOwnAssets
            | ViewOwnTransactions => ScopeRule::Patient,
            ApproveDeposit | MintAT => ScopeRule::HospitalOrBank,
            RecordTrade
            | DistributeProfit
            | ViewOwnHospital
            | ViewHospitalPatients
            | ViewHospitalAssets
            | ViewHospitalTransactions
            | ViewHospitalAuditLogs => ScopeRule::Hospital,
            ViewOwnBank | ViewBankTransactions => ScopeRule::Bank,
            ViewAllPatients | ViewAllAssets | ViewAllTransactions | ViewAllAuditLogs => {
                ScopeRule::System
            }
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Resource scope a permission is checked against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    /// Owning hospital
    pub hospital_id: Option<HospitalId>,
    /// Custodian or owning bank
    pub bank_id: Option<BankId>,
    /// Owning patient
    pub patient_id: Option<PatientId>,
}

impl Scope {
    /// No scope (system-wide permissions)
    pub fn system() -> Self {
        Self::default()
    }

    /// Hospital scope
    pub fn hospital(hospital_id: HospitalId) -> Self {
        Self {
            hospital_id: Some(hospital_id),
            ..Self::default()
        }
    }

    /// Bank scope
    pub fn bank(bank_id: BankId) -> Self {
        Self {
            bank_id: Some(bank_id),
            ..Self::default()
        }
    }

    /// Patient scope
    pub fn patient(patient_id: PatientId) -> Self {
        Self {
            patient_id: Some(patient_id),
            ..Self::default()
        }
    }

    /// Add a bank to the scope
    pub fn with_bank(mut self, bank_id: Option<BankId>) -> Self {
        self.bank_id = bank_id;
        self
    }
}

/// Why a request was denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// Role does not hold the permission
    NotGranted {
        /// Caller role
        role: Role,
        /// Requested permission
        permission: Permission,
    },
    /// Role holds the permission but the resource is outside the actor's scope
    OutOfScope {
        /// Requested permission
        permission: Permission,
        /// Rule that failed
        rule: ScopeRule,
    },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::NotGranted { role, permission } => {
                write!(f, "role {} does not hold {}", role, permission)
            }
            DenialReason::OutOfScope { permission, rule } => {
                write!(f, "{} outside actor scope ({:?})", permission, rule)
            }
        }
    }
}

/// Authorization decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Request may proceed
    Allowed,
    /// Request must abort
    Denied(DenialReason),
}

impl Decision {
    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Convert to `Result`, mapping denials to `PermissionDenied`
    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allowed => Ok(()),
            Decision::Denied(reason) => Err(Error::PermissionDenied(reason.to_string())),
        }
    }
}

/// Immutable role → permission table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<RoleGrants>", into = "Vec<RoleGrants>")]
pub struct PermissionTable {
    grants: BTreeMap<Role, BTreeSet<Permission>>,
}

/// Serialized form of one table row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleGrants {
    /// Role
    pub role: Role,
    /// Permissions held by the role
    pub permissions: Vec<Permission>,
}

impl From<Vec<RoleGrants>> for PermissionTable {
    fn from(rows: Vec<RoleGrants>) -> Self {
        let mut grants: BTreeMap<Role, BTreeSet<Permission>> = BTreeMap::new();
        for row in rows {
            grants.entry(row.role).or_default().extend(row.permissions);
        }
        Self { grants }
    }
}

impl From<PermissionTable> for Vec<RoleGrants> {
    fn from(table: PermissionTable) -> Self {
        table
            .grants
            .into_iter()
            .map(|(role, permissions)| RoleGrants {
                role,
                permissions: permissions.into_iter().collect(),
            })
            .collect()
    }
}

impl PermissionTable {
    /// Build from explicit grants; roles absent from the map hold nothing
    pub fn new(grants: BTreeMap<Role, BTreeSet<Permission>>) -> Self {
        Self { grants }
    }

    /// Permissions held by a role
    pub fn permissions(&self, role: Role) -> impl Iterator<Item = Permission> + '_ {
        self.grants.get(&role).into_iter().flatten().copied()
    }

    /// Whether a role holds a permission
    pub fn grants(&self, role: Role, permission: Permission) -> bool {
        self.grants
            .get(&role)
            .map_or(false, |set| set.contains(&permission))
    }
}

impl Default for PermissionTable {
    fn default() -> Self {
        use Permission::*;

        let table = [
            (
                Role::SuperAdmin,
                vec![
                    ViewAllPatients,
                    ViewAllAssets,
                    ViewAllTransactions,
                    ViewAllAuditLogs,
                ],
            ),
            (
                Role::HospitalAdmin,
                vec![
                    ViewOwnHospital,
                    ViewHospitalPatients,
                    ViewHospitalAssets,
                    ApproveDeposit,
                    MintAT,
                    RecordTrade,
                    DistributeProfit,
                    ViewHospitalTransactions,
                    ViewHospitalAuditLogs,
                ],
            ),
            (
                Role::HospitalStaff,
                vec![ViewOwnHospital, ViewHospitalPatients, ViewHospitalAssets],
            ),
            (
                Role::BankOfficer,
                vec![ViewOwnBank, ViewBankTransactions, ApproveDeposit, MintAT],
            ),
            (
                Role::Patient,
                vec![
                    SubmitDeposit,
                    AllocateAT,
                    RedeemHT,
                    ViewOwnProfile,
                    ViewOwnAssets,
                    ViewOwnTransactions,
                ],
            ),
        ];

        Self::new(
            table
                .into_iter()
                .map(|(role, perms)| (role, perms.into_iter().collect()))
                .collect(),
        )
    }
}

/// Permission checker
#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    table: PermissionTable,
}

impl Authorizer {
    /// Create with an injected table
    pub fn new(table: PermissionTable) -> Self {
        Self { table }
    }

    /// Table in use
    pub fn table(&self) -> &PermissionTable {
        &self.table
    }

    /// Decide whether `actor` may exercise `permission` on `scope`
    pub fn authorize(&self, actor: &Actor, permission: Permission, scope: &Scope) -> Decision {
        if !self.table.grants(actor.role, permission) {
            return Decision::Denied(DenialReason::NotGranted {
                role: actor.role,
                permission,
            });
        }

        if actor.role == Role::SuperAdmin {
            return Decision::Allowed;
        }

        let rule = permission.scope_rule();
        let in_scope = match rule {
            ScopeRule::System => true,
            ScopeRule::Hospital => hospital_matches(actor, scope),
            ScopeRule::Bank => bank_matches(actor, scope),
            ScopeRule::HospitalOrBank => hospital_matches(actor, scope) || bank_matches(actor, scope),
            ScopeRule::Patient => scope
                .patient_id
                .as_ref()
                .map_or(false, |patient| patient.as_str() == actor.id.as_str()),
        };

        if in_scope {
            Decision::Allowed
        } else {
            Decision::Denied(DenialReason::OutOfScope { permission, rule })
        }
    }
}

fn hospital_matches(actor: &Actor, scope: &Scope) -> bool {
    matches!((&actor.hospital_id, &scope.hospital_id), (Some(a), Some(s)) if a == s)
}

fn bank_matches(actor: &Actor, scope: &Scope) -> bool {
    matches!((&actor.bank_id, &scope.bank_id), (Some(a), Some(s)) if a == s)
}
