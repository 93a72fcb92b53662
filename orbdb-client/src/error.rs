// SPDX-License-Identifier: AGPL-3.0-or-later
// OrbDB - Transactional Object Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Client error types

use std::io;

use orbdb_core::proto::WireError;
use orbdb_core::OrbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server: {0}")]
    Server(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("call timed out")]
    Timeout,

    #[error("cache error: {0}")]
    Cache(String),
}

impl From<OrbError> for ClientError {
    fn from(err: OrbError) -> Self {
        match err {
            OrbError::Io(e) => ClientError::Io(e),
            OrbError::Disconnected(s) => ClientError::Disconnected(s),
            OrbError::Protocol(s) => ClientError::Protocol(s),
            other => ClientError::Server(WireError::from(&other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
