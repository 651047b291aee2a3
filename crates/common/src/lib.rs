// tandem-common: wire protocol shared by the relay and its clients

pub mod protocol;
