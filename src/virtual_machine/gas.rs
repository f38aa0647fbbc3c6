//! Gas schedule and metering.

use crate::core::transaction::TransactionType;
use crate::virtual_machine::errors::VmError;

/// Flat cost of every non-coinbase transaction.
pub const TX_BASE_GAS: u64 = 21_000;
/// Cost per byte of transaction data.
pub const TX_DATA_BYTE_GAS: u64 = 16;
/// Extra cost of creating a contract.
pub const DEPLOY_GAS: u64 = 32_000;

/// Gas a transaction pays before any instruction runs.
pub fn intrinsic_gas(tx_type: TransactionType, data_len: usize) -> u64 {
    if tx_type == TransactionType::Coinbase {
        return 0;
    }
    let data = (data_len as u64).saturating_mul(TX_DATA_BYTE_GAS);
    let deploy = if tx_type == TransactionType::Deploy {
        DEPLOY_GAS
    } else {
        0
    };
    TX_BASE_GAS.saturating_add(data).saturating_add(deploy)
}

/// Counts gas down from a fixed budget.
///
/// A charge that would exceed the remaining budget fails without consuming
/// anything, so `used()` never exceeds the limit.
#[derive(Clone, Debug)]
pub struct GasMeter {
    limit: u64,
    used: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn charge(&mut self, amount: u64) -> Result<(), VmError> {
        let remaining = self.remaining();
        if amount > remaining {
            return Err(VmError::OutOfGas {
                needed: amount,
                remaining,
            });
        }
        self.used += amount;
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.used
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intrinsic_gas_by_kind() {
        assert_eq!(intrinsic_gas(TransactionType::Transfer, 0), 21_000);
        assert_eq!(intrinsic_gas(TransactionType::Call, 10), 21_160);
        assert_eq!(intrinsic_gas(TransactionType::Deploy, 1), 53_016);
        assert_eq!(intrinsic_gas(TransactionType::Coinbase, 100), 0);
    }

    #[test]
    fn meter_refuses_overdraft_without_consuming() {
        let mut meter = GasMeter::new(10);
        meter.charge(7).unwrap();
        assert!(matches!(
            meter.charge(4),
            Err(VmError::OutOfGas {
                needed: 4,
                remaining: 3
            })
        ));
        assert_eq!(meter.used(), 7);
        meter.charge(3).unwrap();
        assert_eq!(meter.remaining(), 0);
    }

    #[test]
    fn zero_budget_rejects_any_charge() {
        let mut meter = GasMeter::new(0);
        assert!(meter.charge(1).is_err());
        assert!(meter.charge(0).is_ok());
    }
}
