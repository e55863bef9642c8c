//! In-memory loopback harness shared by the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use muxline_tunnel::{MuxConfig, Multiplexer, Role, StreamCtx, StreamHandler, StreamId, Transport};

/// One direction of the loopback: bytes written by a multiplexer.
#[derive(Default)]
pub struct Pipe {
    pub out: Vec<u8>,
    /// `Some(force)` once closed
    pub closed: Option<bool>,
}

impl Transport for Pipe {
    fn write_parts(&mut self, parts: &[&[u8]]) -> bool {
        if self.closed.is_some() {
            return false;
        }
        for p in parts {
            self.out.extend_from_slice(p);
        }
        true
    }

    fn close(&mut self, force: bool) {
        self.closed.get_or_insert(force);
    }
}

#[derive(Default)]
pub struct Log {
    pub data: Vec<(StreamId, Vec<u8>)>,
    pub remote_closed: Vec<StreamId>,
    pub closed: Vec<StreamId>,
}

impl Log {
    pub fn bytes(&self, id: StreamId) -> Vec<u8> {
        self.data
            .iter()
            .filter(|(s, _)| *s == id)
            .flat_map(|(_, d)| d.iter().copied())
            .collect()
    }
}

pub type SharedLog = Rc<RefCell<Log>>;

/// Records everything; acknowledges delivered bytes when `ack` is set.
pub struct Recorder {
    pub log: SharedLog,
    pub ack: bool,
}

impl StreamHandler for Recorder {
    fn on_data(&mut self, cx: &mut StreamCtx<'_>, id: StreamId, data: &[u8]) {
        self.log.borrow_mut().data.push((id, data.to_vec()));
        if self.ack {
            let _ = cx.try_send_window_update(id, data.len());
        }
    }

    fn on_remote_close(&mut self, _cx: &mut StreamCtx<'_>, id: StreamId) {
        self.log.borrow_mut().remote_closed.push(id);
    }

    fn on_close(&mut self, _cx: &mut StreamCtx<'_>, id: StreamId) {
        self.log.borrow_mut().closed.push(id);
    }
}

/// Sends every byte back, acknowledges it, closes when the peer does.
pub struct Echo {
    pub log: SharedLog,
}

impl StreamHandler for Echo {
    fn on_data(&mut self, cx: &mut StreamCtx<'_>, id: StreamId, data: &[u8]) {
        self.log.borrow_mut().data.push((id, data.to_vec()));
        let _ = cx.send(id, data);
        let _ = cx.try_send_window_update(id, data.len());
    }

    fn on_remote_close(&mut self, cx: &mut StreamCtx<'_>, id: StreamId) {
        self.log.borrow_mut().remote_closed.push(id);
        let _ = cx.close_stream(id, false);
    }

    fn on_close(&mut self, _cx: &mut StreamCtx<'_>, id: StreamId) {
        self.log.borrow_mut().closed.push(id);
    }
}

/// Client and server multiplexers joined back to back.
pub struct Pair {
    pub client: Multiplexer,
    pub server: Multiplexer,
    pub c_io: Pipe,
    pub s_io: Pipe,
    pub client_log: SharedLog,
    pub server_log: SharedLog,
}

impl Pair {
    /// Server echoes every stream.
    pub fn echo(config: MuxConfig) -> Self {
        let server_log: SharedLog = Rc::default();
        let mut server = Multiplexer::new(Role::Server, config.clone());
        let log = Rc::clone(&server_log);
        server.set_acceptor(move |_cx: &mut StreamCtx<'_>, _id: StreamId| {
            Some(Box::new(Echo { log: Rc::clone(&log) }) as Box<dyn StreamHandler>)
        });
        Self {
            client: Multiplexer::new(Role::Client, config),
            server,
            c_io: Pipe::default(),
            s_io: Pipe::default(),
            client_log: Rc::default(),
            server_log,
        }
    }

    /// Server records every stream without answering.
    pub fn sink(config: MuxConfig, ack: bool) -> Self {
        let mut pair = Self::echo(config);
        let log = Rc::clone(&pair.server_log);
        pair.server.set_acceptor(move |_cx: &mut StreamCtx<'_>, _id: StreamId| {
            Some(Box::new(Recorder {
                log: Rc::clone(&log),
                ack,
            }) as Box<dyn StreamHandler>)
        });
        pair
    }

    pub fn open(&mut self, ack: bool) -> StreamId {
        let handler = Recorder {
            log: Rc::clone(&self.client_log),
            ack,
        };
        self.client.open_stream(&mut self.c_io, Box::new(handler)).unwrap()
    }

    /// Shuttle bytes both ways, `chunk` bytes per read, until quiet.
    pub fn pump(&mut self, chunk: usize) {
        loop {
            let to_server = mem::take(&mut self.c_io.out);
            let to_client = mem::take(&mut self.s_io.out);
            if to_server.is_empty() && to_client.is_empty() {
                break;
            }
            for piece in to_server.chunks(chunk) {
                self.server.on_receive_data(&mut self.s_io, piece);
            }
            for piece in to_client.chunks(chunk) {
                self.client.on_receive_data(&mut self.c_io, piece);
            }
        }
    }
}
