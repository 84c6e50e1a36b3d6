//! Stream negotiation and stanza framing for an XMPP client-to-server listener.

pub mod xmpp_stream;
