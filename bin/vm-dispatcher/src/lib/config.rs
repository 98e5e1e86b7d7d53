// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes a dispatcher config which may be parsed from a TOML file.

use std::path::Path;

pub use dispatcher_config::*;

/// Reads the config at `path`, or the defaults when no file is given.
pub fn load(path: Option<&Path>) -> Result<Config, ParseError> {
    match path {
        Some(path) => parse(path),
        None => Ok(Config::default()),
    }
}
