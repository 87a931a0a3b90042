use crate::allocation::{self, AllocationLine, AllocationStrategy, FeeComponent};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{get_required_str, to_json};
use crate::ipc::types::{AppState, Request};
use crate::policy;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

fn parse_amount(params: &serde_json::Value) -> Result<Decimal, HandlerErr> {
    let v = params
        .get("amount")
        .ok_or_else(|| HandlerErr::bad_params("missing amount"))?;
    policy::parse_money(v, "amount").map_err(HandlerErr::bad_params)
}

fn parse_list<T: DeserializeOwned>(params: &serde_json::Value, key: &str) -> Result<Vec<T>, HandlerErr> {
    let raw = params
        .get(key)
        .filter(|v| v.is_array())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array", key)))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid {}: {}", key, e)))
}

fn payments_allocate(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let amount = parse_amount(params)?;
    let components: Vec<FeeComponent> = parse_list(params, "components")?;
    let raw_strategy = get_required_str(params, "strategy")?;
    let strategy = AllocationStrategy::parse(&raw_strategy).ok_or_else(|| {
        HandlerErr::bad_params("strategy must be one of: overdue_first, priority, proportional")
    })?;

    let result = allocation::allocate(amount, &components, strategy)?;
    debug!(
        ?strategy,
        amount = %amount,
        allocated = %result.allocated_total,
        unallocated = %result.unallocated,
        "payment allocated"
    );
    to_json(&result)
}

fn payments_validate(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    // Malformed input is a bad request; a zero or negative amount is reported.
    let amount = params
        .get("amount")
        .ok_or_else(|| HandlerErr::bad_params("missing amount"))
        .and_then(|v| policy::parse_decimal(v, "amount").map_err(HandlerErr::bad_params))?;
    let components: Vec<FeeComponent> = parse_list(params, "components")?;
    let lines: Vec<AllocationLine> = parse_list(params, "allocations")?;
    let report = allocation::validate_allocation(amount, &components, &lines);
    Ok(json!({ "report": to_json(&report)? }))
}

pub fn try_handle(_state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "payments.allocate" => payments_allocate(&req.params),
        "payments.validate" => payments_validate(&req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
