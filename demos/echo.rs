use std::net::SocketAddr;

use reactor_tcp::{EventLoopInner, TcpServer};

fn main() {
    env_logger::init();

    let base_loop = EventLoopInner::new().expect("failed to create base loop");
    let addr: SocketAddr = "127.0.0.1:7890".parse().unwrap();
    let server = TcpServer::new(base_loop.clone(), &addr, "echo", true).expect("failed to bind");

    {
        let mut server = server.borrow_mut();
        server.set_thread_num(4);
        server.set_connection_callback(|conn| {
            log::info!("{} {}", conn.name(), if conn.connected() { "UP" } else { "DOWN" });
        });
        server.set_message_callback(|conn, buf, _receive_time| {
            let bytes = buf.retrieve_all_as_vec();
            conn.send(bytes);
        });
    }

    TcpServer::start(&server);
    log::info!("echo server listening on {}", server.borrow().local_addr().unwrap());

    EventLoopInner::run(&base_loop).expect("base loop exited with an error");
}
