// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod channel;
pub mod configs;
pub mod errors;
pub mod exchange;
pub mod gzip;
pub mod interceptor;
pub mod message;
pub mod model;
pub mod otel;
pub mod producer;
pub mod promise;
pub mod pull_consumer;
pub mod pull_queue;
pub mod queue;
pub mod state;
pub mod topology;
pub mod topology_config;
pub mod topology_handler;
pub mod topology_runner;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
