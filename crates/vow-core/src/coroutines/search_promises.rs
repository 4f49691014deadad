// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keyset-paginated promise search.

use tracing::error;

use crate::api::{Response, ResponseSink, SearchPromisesRequest, decode_cursor, encode_cursor};
use crate::kernel::scheduler::{Coroutine, Step};
use crate::store::{Command, Transaction};
use crate::types::Status;

/// Search promises by id glob and state selector. Returns a next-page
/// cursor whenever the page came back full.
pub fn search_promises(req: SearchPromisesRequest, sink: ResponseSink) -> Coroutine {
    Coroutine::new("search_promises", move |_ctx| {
        let sort_id = match req.cursor.as_deref().map(decode_cursor).transpose() {
            Ok(sort_id) => sort_id,
            Err(err) => return sink.fail(err),
        };

        let limit = req.limit;
        let command = Command::SearchPromises {
            q: req.q.clone(),
            states: req.state.states(),
            limit,
            sort_id,
        };

        Step::store(Transaction::one(command), move |_ctx, outcome| {
            let mut results = match outcome {
                Ok(results) => results,
                Err(err) => {
                    error!(q = %req.q, error = %err, "failed to search promises");
                    return sink.fail(err);
                }
            };

            let (records, last_sort_id) = results.remove(0).into_search_promises();
            let full_page = records.len() as i64 == limit;

            let mut promises = Vec::with_capacity(records.len());
            for record in records {
                match record.into_promise() {
                    Ok(promise) => promises.push(promise),
                    Err(err) => {
                        error!(q = %req.q, error = %err, "failed to decode promise record");
                        return sink.fail(err);
                    }
                }
            }

            let cursor = full_page.then(|| encode_cursor(last_sort_id));
            sink.respond(Response::Search {
                status: Status::Ok,
                cursor,
                promises,
            })
        })
    })
}
