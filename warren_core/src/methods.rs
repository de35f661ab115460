//! Decoded AMQP 0-9-1 method values.
//!
//! The wire codec lives with the transport collaborator; the broker core only
//! ever sees and produces these decoded forms. The set is trimmed to the
//! classes the core handles: channel, exchange, queue, basic, confirm, tx,
//! plus the connection close pair needed to surface connection errors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type ReplyCode = u16;
pub type ReplyText = String;
pub type ClassId = u16;
pub type MethodId = u16;
pub type ConsumerTag = String;
pub type DeliveryTag = u64;
pub type Shortstr = String;
pub type Longstr = String;

pub type TableFieldName = String;

pub type Table = HashMap<TableFieldName, FieldValue>;

/// A field-table value in the RabbitMQ dialect: the base 0-9-1 set plus
/// short strings, timestamps, decimals, nested tables and byte arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Boolean(bool),
    ShortShortInt(i8),
    ShortShortUInt(u8),
    ShortInt(i16),
    ShortUInt(u16),
    LongInt(i32),
    LongUInt(u32),
    LongLongInt(i64),
    LongLongUInt(u64),
    Float(f32),
    Double(f64),
    DecimalValue(u8, u32),
    ShortString(Shortstr),
    LongString(Longstr),
    FieldArray(Vec<FieldValue>),
    Timestamp(u64),
    FieldTable(Table),
    ByteArray(Vec<u8>),
    Void,
}

impl FieldValue {
    /// The string payload, for values where the dialect allows either string form.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::ShortString(s) | FieldValue::LongString(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionClose {
    pub reply_code: ReplyCode,
    pub reply_text: ReplyText,
    pub class_id: ClassId,
    pub method_id: MethodId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionCloseOk;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFlow {
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFlowOk {
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelClose {
    pub reply_code: ReplyCode,
    pub reply_text: ReplyText,
    pub class_id: ClassId,
    pub method_id: MethodId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCloseOk;

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDeclare {
    pub exchange: String,
    pub kind: String,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: Table,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDeclareOk;

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDelete {
    pub exchange: String,
    pub if_unused: bool,
    pub no_wait: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDeleteOk;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclare {
    pub queue: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: Table,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueBind {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub arguments: Table,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueBindOk;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueUnbind {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: Table,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueUnbindOk;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuePurge {
    pub queue: String,
    pub no_wait: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuePurgeOk {
    pub message_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueDelete {
    pub queue: String,
    pub if_unused: bool,
    pub if_empty: bool,
    pub no_wait: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeleteOk {
    pub message_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicQos {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicQosOk;

#[derive(Debug, Clone, PartialEq)]
pub struct BasicConsume {
    pub queue: String,
    pub consumer_tag: ConsumerTag,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: Table,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicConsumeOk {
    pub consumer_tag: ConsumerTag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicCancel {
    pub consumer_tag: ConsumerTag,
    pub no_wait: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicCancelOk {
    pub consumer_tag: ConsumerTag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicPublish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicReturn {
    pub reply_code: ReplyCode,
    pub reply_text: ReplyText,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicDeliver {
    pub consumer_tag: ConsumerTag,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicGet {
    pub queue: String,
    pub no_ack: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicGetOk {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicGetEmpty;

#[derive(Debug, Clone, PartialEq)]
pub struct BasicAck {
    pub delivery_tag: DeliveryTag,
    pub multiple: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicNack {
    pub delivery_tag: DeliveryTag,
    pub multiple: bool,
    pub requeue: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicReject {
    pub delivery_tag: DeliveryTag,
    pub requeue: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicRecover {
    pub requeue: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicRecoverOk;

#[derive(Debug, Clone, PartialEq)]
pub struct BasicRecoverAsync {
    pub requeue: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmSelect {
    pub no_wait: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmSelectOk;

#[derive(Debug, Clone, PartialEq)]
pub struct TxSelect;

#[derive(Debug, Clone, PartialEq)]
pub struct TxSelectOk;

#[derive(Debug, Clone, PartialEq)]
pub struct TxCommit;

#[derive(Debug, Clone, PartialEq)]
pub struct TxCommitOk;

#[derive(Debug, Clone, PartialEq)]
pub struct TxRollback;

#[derive(Debug, Clone, PartialEq)]
pub struct TxRollbackOk;

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionClose(ConnectionClose),
    ConnectionCloseOk(ConnectionCloseOk),
    ChannelFlow(ChannelFlow),
    ChannelFlowOk(ChannelFlowOk),
    ChannelClose(ChannelClose),
    ChannelCloseOk(ChannelCloseOk),
    ExchangeDeclare(ExchangeDeclare),
    ExchangeDeclareOk(ExchangeDeclareOk),
    ExchangeDelete(ExchangeDelete),
    ExchangeDeleteOk(ExchangeDeleteOk),
    QueueDeclare(QueueDeclare),
    QueueDeclareOk(QueueDeclareOk),
    QueueBind(QueueBind),
    QueueBindOk(QueueBindOk),
    QueueUnbind(QueueUnbind),
    QueueUnbindOk(QueueUnbindOk),
    QueuePurge(QueuePurge),
    QueuePurgeOk(QueuePurgeOk),
    QueueDelete(QueueDelete),
    QueueDeleteOk(QueueDeleteOk),
    BasicQos(BasicQos),
    BasicQosOk(BasicQosOk),
    BasicConsume(BasicConsume),
    BasicConsumeOk(BasicConsumeOk),
    BasicCancel(BasicCancel),
    BasicCancelOk(BasicCancelOk),
    BasicPublish(BasicPublish),
    BasicReturn(BasicReturn),
    BasicDeliver(BasicDeliver),
    BasicGet(BasicGet),
    BasicGetOk(BasicGetOk),
    BasicGetEmpty(BasicGetEmpty),
    BasicAck(BasicAck),
    BasicNack(BasicNack),
    BasicReject(BasicReject),
    BasicRecover(BasicRecover),
    BasicRecoverOk(BasicRecoverOk),
    BasicRecoverAsync(BasicRecoverAsync),
    ConfirmSelect(ConfirmSelect),
    ConfirmSelectOk(ConfirmSelectOk),
    TxSelect(TxSelect),
    TxSelectOk(TxSelectOk),
    TxCommit(TxCommit),
    TxCommitOk(TxCommitOk),
    TxRollback(TxRollback),
    TxRollbackOk(TxRollbackOk),
}

/// Class ids, as carried in content headers and close payloads.
pub mod class {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
    pub const CONFIRM: u16 = 85;
    pub const TX: u16 = 90;
}
