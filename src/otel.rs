// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! [`TracePropagationInterceptor`] carries trace context through AMQP message
//! headers: on publish it injects the current context with the globally
//! registered propagator, on delivery it extracts the producer's context and
//! wraps the rest of the pipeline in a consumer span whose status reflects the
//! ack decision.

use crate::{
    errors::LinkError,
    interceptor::{Interceptor, Next},
    message::{AckStrategy, ConsumedMessage, PublishMessage},
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Adapter exposing AMQP headers to OpenTelemetry propagators.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeadersPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

fn headers_of(props: &BasicProperties) -> BTreeMap<ShortString, AMQPValue> {
    props.headers().clone().unwrap_or_default().inner().clone()
}

/// Returns `props` with the trace context of `ctx` added to its headers.
pub fn inject_context(props: BasicProperties, ctx: &Context) -> BasicProperties {
    let mut headers = headers_of(&props);

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeadersPropagator::new(&mut headers))
    });

    props.with_headers(FieldTable::from(headers))
}

/// Extracts the trace context from `props` and starts a consumer span named `name` in it.
pub fn new_span(props: &BasicProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = headers_of(props);
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Interceptor propagating trace context on both pipelines.
pub struct TracePropagationInterceptor {
    tracer: BoxedTracer,
}

impl Default for TracePropagationInterceptor {
    fn default() -> Self {
        Self::new("rabbitlink")
    }
}

impl TracePropagationInterceptor {
    /// Uses the global tracer provider's tracer named `tracer_name`.
    pub fn new(tracer_name: &'static str) -> Self {
        TracePropagationInterceptor {
            tracer: global::tracer(tracer_name),
        }
    }
}

#[async_trait]
impl Interceptor<PublishMessage, ()> for TracePropagationInterceptor {
    async fn intercept(
        &self,
        mut message: PublishMessage,
        cancellation: CancellationToken,
        next: Next<'_, PublishMessage, ()>,
    ) -> Result<(), LinkError> {
        message.properties = inject_context(message.properties, &Context::current());
        next(message, cancellation).await
    }
}

#[async_trait]
impl Interceptor<ConsumedMessage, AckStrategy> for TracePropagationInterceptor {
    async fn intercept(
        &self,
        message: ConsumedMessage,
        cancellation: CancellationToken,
        next: Next<'_, ConsumedMessage, AckStrategy>,
    ) -> Result<AckStrategy, LinkError> {
        let name = format!("{} receive", message.receive.queue);
        let (_ctx, mut span) = new_span(&message.properties, &self.tracer, &name);

        let res = next(message, cancellation).await;

        match &res {
            Ok(AckStrategy::Ack) => span.set_status(Status::Ok),
            Ok(strategy) => span.set_status(Status::Error {
                description: Cow::from(format!("message rejected ({strategy:?})")),
            }),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();

        res
    }
}
