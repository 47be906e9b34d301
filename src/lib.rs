// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Launcher and supervisor for the Refeeder and Snapshoter workers

pub mod config;
pub mod control;
pub mod env;
pub mod error;
pub mod fork;
pub mod msg;
pub mod procs;
pub mod session;
pub mod tmux;

pub use error::Error;
