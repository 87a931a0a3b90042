//! Splitting a fee payment across outstanding fee components.
//!
//! Three strategies: overdue-first, priority, and proportional. Proportional
//! shares are floored to the cent and the leftover cents go to the largest
//! remainders, so the allocations always add up to the amount paid.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    OverdueFirst,
    Priority,
    Proportional,
}

impl AllocationStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overdue_first" | "overdueFirst" => Some(Self::OverdueFirst),
            "priority" => Some(Self::Priority),
            "proportional" => Some(Self::Proportional),
            _ => None,
        }
    }
}

/// An outstanding fee line. Lower `priority` is paid first.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeComponent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub balance: Decimal,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub overdue: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentAllocation {
    pub component_id: String,
    pub name: String,
    pub amount: Decimal,
    pub remaining_balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub strategy: AllocationStrategy,
    pub allocations: Vec<ComponentAllocation>,
    pub allocated_total: Decimal,
    pub unallocated: Decimal,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AllocationError {
    #[error("payment amount must be positive")]
    NonPositiveAmount,

    #[error("component {0} has a negative balance")]
    NegativeBalance(String),

    #[error("component {0} appears more than once")]
    DuplicateComponent(String),
}

fn cents(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn check_inputs(amount: Decimal, components: &[FeeComponent]) -> Result<(), AllocationError> {
    if amount <= Decimal::ZERO {
        return Err(AllocationError::NonPositiveAmount);
    }
    let mut seen = HashSet::new();
    for c in components {
        if c.balance < Decimal::ZERO {
            return Err(AllocationError::NegativeBalance(c.id.clone()));
        }
        if !seen.insert(c.id.as_str()) {
            return Err(AllocationError::DuplicateComponent(c.id.clone()));
        }
    }
    Ok(())
}

pub fn allocate(
    amount: Decimal,
    components: &[FeeComponent],
    strategy: AllocationStrategy,
) -> Result<AllocationResult, AllocationError> {
    check_inputs(amount, components)?;
    let amount = cents(amount);

    let allocations = match strategy {
        AllocationStrategy::OverdueFirst => {
            let mut order: Vec<&FeeComponent> = components.iter().collect();
            // Stable sort keeps input order among equals.
            order.sort_by_key(|c| (!c.overdue, c.priority));
            greedy(amount, order)
        }
        AllocationStrategy::Priority => {
            let mut order: Vec<&FeeComponent> = components.iter().collect();
            order.sort_by_key(|c| c.priority);
            greedy(amount, order)
        }
        AllocationStrategy::Proportional => proportional(amount, components),
    };

    let allocated_total: Decimal = allocations.iter().map(|a| a.amount).sum();
    Ok(AllocationResult {
        strategy,
        allocations,
        allocated_total,
        unallocated: amount - allocated_total,
    })
}

fn greedy(amount: Decimal, order: Vec<&FeeComponent>) -> Vec<ComponentAllocation> {
    let mut remaining = amount;
    order
        .into_iter()
        .map(|c| {
            let balance = cents(c.balance);
            let take = remaining.min(balance);
            remaining -= take;
            ComponentAllocation {
                component_id: c.id.clone(),
                name: c.name.clone(),
                amount: take,
                remaining_balance: balance - take,
            }
        })
        .collect()
}

fn proportional(amount: Decimal, components: &[FeeComponent]) -> Vec<ComponentAllocation> {
    let balances: Vec<Decimal> = components.iter().map(|c| cents(c.balance)).collect();
    let total: Decimal = balances.iter().copied().sum();
    let payable = amount.min(total);

    let mut shares: Vec<Decimal> = Vec::with_capacity(components.len());
    let mut remainders: Vec<(usize, Decimal)> = Vec::with_capacity(components.len());
    for (i, balance) in balances.iter().enumerate() {
        if total.is_zero() {
            shares.push(Decimal::ZERO);
            continue;
        }
        let exact = payable * *balance / total;
        let floored = exact.round_dp_with_strategy(2, RoundingStrategy::ToZero);
        shares.push(floored);
        remainders.push((i, exact - floored));
    }

    let cent = Decimal::new(1, 2);
    let floored_total: Decimal = shares.iter().copied().sum();
    let mut leftover = ((payable - floored_total) / cent).to_i64().unwrap_or(0);

    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (i, _) in remainders {
        if leftover <= 0 {
            break;
        }
        if shares[i] + cent <= balances[i] {
            shares[i] += cent;
            leftover -= 1;
        }
    }

    components
        .iter()
        .zip(shares)
        .zip(balances)
        .map(|((c, share), balance)| ComponentAllocation {
            component_id: c.id.clone(),
            name: c.name.clone(),
            amount: share,
            remaining_balance: balance - share,
        })
        .collect()
}

/// One line of a manually entered allocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationLine {
    pub component_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn validate_allocation(
    amount: Decimal,
    components: &[FeeComponent],
    lines: &[AllocationLine],
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if amount <= Decimal::ZERO {
        report.errors.push("payment amount must be positive".into());
    }
    let mut balances: HashMap<&str, Decimal> = HashMap::new();
    for c in components {
        if c.balance < Decimal::ZERO {
            report
                .errors
                .push(format!("component {} has a negative balance", c.id));
        } else if c.balance.is_zero() {
            report
                .warnings
                .push(format!("component {} has nothing outstanding", c.id));
        }
        if balances.insert(c.id.as_str(), c.balance).is_some() {
            report
                .errors
                .push(format!("component {} appears more than once", c.id));
        }
    }

    let mut seen = HashSet::new();
    let mut total = Decimal::ZERO;
    for line in lines {
        if !seen.insert(line.component_id.as_str()) {
            report.errors.push(format!(
                "component {} is allocated more than once",
                line.component_id
            ));
        }
        if line.amount < Decimal::ZERO {
            report.errors.push(format!(
                "allocation to {} must not be negative",
                line.component_id
            ));
        }
        match balances.get(line.component_id.as_str()) {
            None => report
                .errors
                .push(format!("unknown component {}", line.component_id)),
            Some(balance) if line.amount > *balance => report.errors.push(format!(
                "allocation of {} to {} exceeds its balance of {}",
                line.amount, line.component_id, balance
            )),
            Some(_) => {}
        }
        total += line.amount;
    }

    if total > amount {
        report.errors.push(format!(
            "allocated total {} exceeds payment of {}",
            total, amount
        ));
    } else if total < amount && amount > Decimal::ZERO {
        report
            .warnings
            .push(format!("{} of the payment is unallocated", amount - total));
    }

    report.is_valid = report.errors.is_empty();
    report
}
