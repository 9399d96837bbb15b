// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! A fixed-capacity, thread-safe cache of device sectors.
//!
//! `bufcache` sits between a filesystem layer and a sector-addressable
//! block device. Repeated access to the same sector is served from memory,
//! writes complete as soon as the cache holds the new payload, and a
//! background worker writes dirty sectors back to the device when the
//! clock-sweep replacement policy evicts them. Callers on different
//! sectors proceed in parallel; callers on the same sector are ordered by
//! a per-slot reader/writer protocol that favors writers.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;
#[cfg(test)]
extern crate rand;

pub mod core;
pub mod error;
