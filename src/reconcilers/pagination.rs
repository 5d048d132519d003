// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Pagination helpers for Kubernetes API list operations.
//!
//! This module provides utilities for efficiently listing large resource sets
//! by fetching them in pages, reducing memory usage and API server load. The
//! policy reconcilers use it whenever they enumerate bindings by label.

use crate::constants::KUBE_LIST_PAGE_SIZE;
use anyhow::Result;
use kube::{api::ListParams, Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::{debug, error};

/// Maximum number of pages to fetch before aborting pagination.
///
/// Guards against a continue token that never terminates. With 100 items per
/// page, 10,000 pages = 1,000,000 resources maximum.
const MAX_REASONABLE_PAGES: usize = 10_000;

/// List all resources with automatic pagination.
///
/// Fetches resources in pages to reduce memory usage and API server load.
///
/// # Arguments
///
/// * `api` - Kubernetes API client for the resource type
/// * `list_params` - Base list parameters (labels, fields, etc.)
///
/// # Returns
///
/// Vector of all resources, fetched in pages
///
/// # Errors
///
/// Returns an error if Kubernetes API operations fail.
pub async fn list_all_paginated<K>(api: &Api<K>, mut list_params: ListParams) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    list_params.limit = Some(KUBE_LIST_PAGE_SIZE);

    let mut all_items = Vec::new();
    let mut page_count = 0;
    let mut last_continue_token: Option<String> = None;

    loop {
        page_count += 1;

        debug!(
            page = page_count,
            continue_token = ?list_params.continue_token,
            "Fetching page from Kubernetes API"
        );

        if page_count > MAX_REASONABLE_PAGES {
            error!(
                pages = page_count,
                "Aborting pagination after too many pages"
            );
            anyhow::bail!("pagination exceeded {MAX_REASONABLE_PAGES} pages");
        }

        let list = api.list(&list_params).await?;
        all_items.extend(list.items);

        match list.metadata.continue_ {
            Some(token) if !token.is_empty() => {
                // A repeating token would loop forever.
                if last_continue_token.as_deref() == Some(token.as_str()) {
                    anyhow::bail!("pagination continue token repeated");
                }
                last_continue_token = Some(token.clone());
                list_params.continue_token = Some(token);
            }
            _ => break,
        }
    }

    debug!(items = all_items.len(), pages = page_count, "Listed all pages");
    Ok(all_items)
}

#[cfg(test)]
#[path = "pagination_tests.rs"]
mod pagination_tests;
