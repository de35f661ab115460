use std::ops::Not;

use warren_core::{
    connection::Channel,
    methods::{ExchangeDeclare, ExchangeDeclareOk, ExchangeDelete, ExchangeDeleteOk, Method},
};

use crate::{methods::MethodResponse, server::Broker, topology};

pub(crate) fn declare(
    broker: &Broker,
    channel: &Channel,
    declare: ExchangeDeclare,
) -> MethodResponse {
    let no_wait = declare.no_wait;
    topology::declare_exchange(&channel.vhost, broker.stores(), &declare)?;
    Ok(no_wait
        .not()
        .then(|| Method::ExchangeDeclareOk(ExchangeDeclareOk)))
}

pub(crate) fn delete(broker: &Broker, channel: &Channel, delete: ExchangeDelete) -> MethodResponse {
    topology::delete_exchange(
        &channel.vhost,
        broker.stores(),
        &delete.exchange,
        delete.if_unused,
    )?;
    Ok(delete
        .no_wait
        .not()
        .then(|| Method::ExchangeDeleteOk(ExchangeDeleteOk)))
}
