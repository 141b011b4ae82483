mod interval;
mod register;
mod register_type;
mod row;

pub use self::{
    interval::TimeInterval,
    register::{DataKind, RegisterDescriptor, RegisterSample, Registers},
    register_type::RegisterType,
    row::DataRow,
};
