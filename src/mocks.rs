// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    errors::LinkError,
    exchange::ExchangeKind,
    model::{AmqpModel, ConsumeOptions, DeliveryStream},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties,
};
use mockall::*;

mock! {
  pub AmqpModelImpl {}

  #[async_trait]
  impl AmqpModel for AmqpModelImpl {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), LinkError>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, LinkError>;

    async fn queue_delete(&self, name: &str, if_unused: bool, if_empty: bool)
        -> Result<u32, LinkError>;

    async fn queue_purge(&self, name: &str) -> Result<u32, LinkError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), LinkError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, LinkError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), LinkError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), LinkError>;

    async fn confirm_select(&self) -> Result<(), LinkError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), LinkError>;

    async fn close(&self) -> Result<(), LinkError>;
  }
}
