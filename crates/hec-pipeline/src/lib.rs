// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of CI build, console and file events to an HTTP Event Collector.
//!
//! Producers hand [`event::EventRecord`]s to a [`service::DeliveryService`],
//! which buffers them in a bounded [`queue::EventQueue`] and posts them from a
//! pool of [`worker::DeliveryWorker`]s. Collector responses are classified by
//! [`classifier`] into delivered, retried with backoff, or discarded. Console
//! output is buffered per build by [`console::ConsoleCapture`] streams that
//! flush on a growing timer and are reclaimed if never closed.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod classifier;
pub mod config;
pub mod console;
pub mod constants;
pub mod decorator;
pub mod error;
pub mod event;
pub mod file_sender;
pub mod flush_scheduler;
pub mod http;
pub mod logger;
pub mod queue;
pub mod service;
pub mod worker;
