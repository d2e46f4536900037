mod header;
mod message;
#[cfg(test)]
mod test;

pub(crate) use self::{
    header::next_request_id,
    message::{DocumentSequence, Message, MessageFlags},
};
