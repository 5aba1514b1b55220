use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

/// a pair of connected sockets on the loopback interface
pub async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), server.unwrap().0)
}

/// Returns a loopback address whose port was free a moment ago. Tests binding the returned
///  address can in theory race with other processes.
pub fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
