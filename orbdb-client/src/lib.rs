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

//! OrbDB Client
//!
//! Networked stub for an OrbDB storage: synchronous RPC over the framed
//! protocol, a persistent two-file blob cache, and invalidation-driven
//! cache coherence.

pub mod cache;
pub mod connection;
pub mod error;

pub use cache::ClientCache;
pub use connection::{ConnectOptions, Connection, InvalidationHandler, NullHandler};
pub use error::{ClientError, Result};
