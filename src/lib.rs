/*
 *
 * Copyright 2025 Crossbar authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! Client-side RPC dispatch runtime.
//!
//! A [`client::channel::Channel`] is a logical, persistent connection to a
//! target.  The channel resolves its target through a pluggable name
//! resolver, distributes the resulting service config, drives a
//! load-balancing policy that manages subchannels (individual connections),
//! and routes each RPC through a dynamically assembled filter stack onto a
//! picked, connected subchannel.
//!
//! The crate does not open sockets or speak any wire protocol itself; those
//! concerns live behind the [`client::transport::Transport`] trait.

#![allow(dead_code)]

pub mod client;
pub mod inmemory;
pub mod rt;
pub mod service;

pub(crate) mod attributes;
pub(crate) mod byte_str;
