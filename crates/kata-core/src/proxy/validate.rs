// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fragment validation.
//!
//! Runs on the JSON form of a fragment, so it covers generated fragments and
//! user routing documents alike.

use serde_json::Value;
use thiserror::Error;

/// Why a fragment was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FragmentError {
    /// The fragment is not a JSON object.
    #[error("fragment must be an object")]
    NotAnObject,

    /// `listen` is present but not a list.
    #[error("'listen' must be a list")]
    ListenNotList,

    /// Neither `routes` nor `handle` is present.
    #[error("fragment needs 'routes' or 'handle'")]
    NoRoutes,

    /// A handler entry has no `handler` type.
    #[error("handler at {0} has no 'handler' type")]
    MissingHandlerType(String),

    /// A `routes` or `handle` field has the wrong shape.
    #[error("{0} must be a list")]
    NotAList(String),
}

/// Check that `fragment` can be spliced into the proxy document.
pub fn validate_fragment(fragment: &Value) -> Result<(), FragmentError> {
    let object = fragment.as_object().ok_or(FragmentError::NotAnObject)?;

    if let Some(listen) = object.get("listen")
        && !listen.is_array()
    {
        return Err(FragmentError::ListenNotList);
    }

    let routes = object.get("routes");
    let handle = object.get("handle");
    if routes.is_none() && handle.is_none() {
        return Err(FragmentError::NoRoutes);
    }

    if let Some(handle) = handle {
        check_handlers(handle, "handle")?;
    }
    if let Some(routes) = routes {
        check_routes(routes, "routes")?;
    }
    Ok(())
}

fn check_routes(routes: &Value, location: &str) -> Result<(), FragmentError> {
    let routes = routes
        .as_array()
        .ok_or_else(|| FragmentError::NotAList(location.to_string()))?;
    for (idx, route) in routes.iter().enumerate() {
        if let Some(handle) = route.get("handle") {
            check_handlers(handle, &format!("{location}[{idx}].handle"))?;
        }
    }
    Ok(())
}

fn check_handlers(handlers: &Value, location: &str) -> Result<(), FragmentError> {
    let handlers = handlers
        .as_array()
        .ok_or_else(|| FragmentError::NotAList(location.to_string()))?;
    for (idx, handler) in handlers.iter().enumerate() {
        let here = format!("{location}[{idx}]");
        if !handler.get("handler").is_some_and(Value::is_string) {
            return Err(FragmentError::MissingHandlerType(here));
        }
        if let Some(routes) = handler.get("routes") {
            check_routes(routes, &format!("{here}.routes"))?;
        }
    }
    Ok(())
}
