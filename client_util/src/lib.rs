// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Browser-side plumbing for quiz clients: the reconnecting websocket,
//! persisted session credentials, and subscription utilities.

pub mod apply;
pub mod backoff;
pub mod js_hooks;
pub mod local_storage;
pub mod manager;
pub mod reconn_web_socket;
pub mod session_storage;
pub mod subscriber;
pub mod web_socket;
