//! Tenant scoping.
//!
//! A [`TenantContext`] can only be obtained from an active [`Company`], and every storage read
//! and pipeline stage takes one by reference. Entities crossing a boundary are checked against
//! it with [`TenantContext::ensure_owns`].

use crate::domain::Company;
use crate::error::PipelineError;
use crate::ids::CompanyId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    company_id: CompanyId,
}

impl TenantContext {
    pub fn for_company(company: &Company) -> Result<Self, PipelineError> {
        if !company.active {
            return Err(PipelineError::CompanyInactive(company.id));
        }
        Ok(Self {
            company_id: company.id,
        })
    }

    pub fn company_id(&self) -> CompanyId {
        self.company_id
    }

    pub fn ensure_owns(&self, owner: CompanyId, entity: &'static str) -> Result<(), PipelineError> {
        if owner != self.company_id {
            tracing::error!(
                expected = %self.company_id,
                found = %owner,
                entity,
                "tenant isolation violation"
            );
            return Err(PipelineError::TenantIsolation {
                expected: self.company_id,
                found: owner,
                entity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn inactive_company_yields_no_context() {
        let company = Company {
            id: CompanyId(Uuid::from_u128(7)),
            active: false,
        };
        let err = TenantContext::for_company(&company).unwrap_err();
        assert_eq!(err.reason_code(), "company_inactive");
    }

    #[test]
    fn foreign_owner_is_rejected() {
        let company = Company {
            id: CompanyId(Uuid::from_u128(7)),
            active: true,
        };
        let tenant = TenantContext::for_company(&company).unwrap();
        assert!(tenant.ensure_owns(company.id, "survey").is_ok());
        let err = tenant
            .ensure_owns(CompanyId(Uuid::from_u128(8)), "response")
            .unwrap_err();
        assert_eq!(err.reason_code(), "tenant_isolation_violation");
    }
}
