// Wire formats spoken on a relay socket.
//
// Binary frames carry y-sync messages (document sync and awareness); text
// frames carry the JSON control channel.

pub mod control;
pub mod frame;
