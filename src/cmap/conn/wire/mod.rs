mod header;
mod message;
#[cfg(test)]
mod test;
mod util;

pub(crate) use self::{
    message::{DocumentSequence, Message, MessageFlags},
    util::RequestIdGenerator,
};
