mod ack;
mod consume;
mod exchange;
pub(crate) mod publish;
mod queue;
mod tx;

pub(crate) use ack::requeue_deliveries;

use tracing::{debug, warn};
use warren_core::{
    connection::{Channel, PublishAssembly},
    error::ConException,
    method_unsupported,
    methods::Method,
};

use crate::{channel, server::Broker};

pub(crate) type MethodResponse = crate::Result<Option<Method>>;

/// The entrypoint for every decoded method on an open channel. Returns the
/// synchronous reply to send, if the method has one and `no-wait` was not
/// set.
pub(crate) fn handle_method(broker: &Broker, channel: Channel, method: Method) -> MethodResponse {
    use Method::*;

    debug!(?method, channel = %channel.num, "Handling method");

    // Any method other than basic.publish aborts an unfinished content
    // assembly on the channel.
    if !matches!(method, BasicPublish(_)) {
        channel.state().assembly = PublishAssembly::Idle;
    }

    let response = match method {
        ExchangeDeclare(m) => exchange::declare(broker, &channel, m)?,
        ExchangeDelete(m) => exchange::delete(broker, &channel, m)?,
        QueueDeclare(m) => queue::declare(broker, &channel, m)?,
        QueueBind(m) => queue::bind(broker, &channel, m)?,
        QueueUnbind(m) => queue::unbind(broker, &channel, m)?,
        QueuePurge(m) => queue::purge(broker, &channel, m)?,
        QueueDelete(m) => queue::delete(broker, &channel, m)?,
        BasicQos(m) => consume::qos(&channel, m)?,
        BasicConsume(m) => consume::consume(&channel, m)?,
        BasicCancel(m) => consume::cancel(&channel, m)?,
        BasicGet(m) => consume::get(broker, &channel, m)?,
        BasicPublish(m) => publish::start(&channel, m)?,
        BasicAck(m) => ack::ack(broker, &channel, m)?,
        BasicNack(m) => ack::nack(broker, &channel, m)?,
        BasicReject(m) => ack::reject(broker, &channel, m)?,
        BasicRecover(m) => ack::recover(broker, &channel, m)?,
        BasicRecoverAsync(_) => method_unsupported!(),
        ConfirmSelect(m) => tx::confirm_select(&channel, m)?,
        TxSelect(_) => tx::select(&channel)?,
        TxCommit(_) => tx::commit(broker, &channel)?,
        TxRollback(_) => tx::rollback(broker, &channel)?,
        ChannelFlow(m) => {
            channel::set_flow(&channel, m.active);
            Some(Method::ChannelFlowOk(warren_core::methods::ChannelFlowOk {
                active: m.active,
            }))
        }
        ConnectionClose(_) | ConnectionCloseOk(_) | ChannelClose(_) | ChannelCloseOk(_) => {
            warn!("method should be processed by transport layer");
            return Err(ConException::NotAllowed.into());
        }
        // only ever sent by the server
        ChannelFlowOk(_) | ExchangeDeclareOk(_) | ExchangeDeleteOk(_) | QueueDeclareOk(_)
        | QueueBindOk(_) | QueueUnbindOk(_) | QueuePurgeOk(_) | QueueDeleteOk(_)
        | BasicQosOk(_) | BasicConsumeOk(_) | BasicCancelOk(_) | BasicReturn(_)
        | BasicDeliver(_) | BasicGetOk(_) | BasicGetEmpty(_) | BasicRecoverOk(_)
        | ConfirmSelectOk(_) | TxSelectOk(_) | TxCommitOk(_) | TxRollbackOk(_) => {
            return Err(ConException::NotAllowed.into());
        }
    };

    Ok(response)
}
