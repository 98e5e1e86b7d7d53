// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM-level pieces migration depends on: the config slice it rewrites, the
//! host snapshot it compares against, bundle filesystem helpers and event
//! publication.

pub mod bundle;
pub mod config;
pub mod host;
pub mod state_publisher;
