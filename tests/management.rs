// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use fastcgi_server::Server;
use std::{
    io::Write,
    net::{TcpListener, TcpStream},
    time::Duration,
};

mod common;

fn serve(max_connections: usize, max_requests: u16) -> (Server, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(listener, max_connections, max_requests, 1).unwrap();
    let client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    (server, client)
}

#[test]
fn get_values_answers_only_known_names() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve(10, 5);

    let mut names = common::pair(b"FCGI_MAX_CONNS", b"");
    names.extend(common::pair(b"FCGI_MPXS_CONNS", b""));
    names.extend(common::pair(b"X_UNKNOWN", b""));
    client
        .write_all(&common::record(common::GET_VALUES, 0, &names))
        .unwrap();

    common::drive(&mut server);
    let reply = common::read_record(&mut client).unwrap();
    assert_eq!(reply.record_type, common::GET_VALUES_RESULT);
    assert_eq!(reply.request_id, 0);
    assert_eq!(reply.wire_len() % 8, 0);

    let pairs = common::decode_pairs(&reply.content);
    assert_eq!(pairs.len(), 2);
    assert!(pairs.contains(&(b"FCGI_MAX_CONNS".to_vec(), b"10".to_vec())));
    assert!(pairs.contains(&(b"FCGI_MPXS_CONNS".to_vec(), b"1".to_vec())));
}

#[test]
fn get_values_reports_the_request_product() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve(10, 5);

    let names = common::pair(b"FCGI_MAX_REQS", b"");
    client
        .write_all(&common::record(common::GET_VALUES, 0, &names))
        .unwrap();

    common::drive(&mut server);
    let reply = common::read_record(&mut client).unwrap();
    let pairs = common::decode_pairs(&reply.content);
    assert_eq!(pairs, vec![(b"FCGI_MAX_REQS".to_vec(), b"50".to_vec())]);
}

#[test]
fn unknown_management_types_are_answered() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve(10, 5);

    // Type 0xc8 is no defined record type; sent with the null request
    // id it is a management record and must be answered.
    client
        .write_all(&common::record(0xc8, 0, b"junk"))
        .unwrap();

    common::drive(&mut server);
    let reply = common::read_record(&mut client).unwrap();
    assert_eq!(reply.record_type, common::UNKNOWN_TYPE);
    assert_eq!(reply.request_id, 0);
    assert_eq!(reply.content.len(), 8);
    assert_eq!(reply.content[0], 0xc8);
    assert_eq!(reply.wire_len() % 8, 0);
}

#[test]
fn application_types_with_null_id_are_management_records() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve(10, 5);

    // A begin request carrying the null id never names a request; it
    // is answered as an unknown management type.
    client.write_all(&common::begin_request(0, 1, 0)).unwrap();

    common::drive(&mut server);
    let reply = common::read_record(&mut client).unwrap();
    assert_eq!(reply.record_type, common::UNKNOWN_TYPE);
    assert_eq!(reply.content[0], common::BEGIN_REQUEST);
}

#[test]
fn get_values_interleaves_with_requests() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve(10, 5);

    let mut bytes = common::begin_request(1, 1, 1);
    bytes.extend(common::record(common::PARAMS, 1, &[]));
    bytes.extend(common::record(
        common::GET_VALUES,
        0,
        &common::pair(b"FCGI_MPXS_CONNS", b""),
    ));
    bytes.extend(common::record(common::STDIN, 1, &[]));
    client.write_all(&bytes).unwrap();

    let mut batch = common::poll_requests(&mut server, 10);
    assert_eq!(batch.len(), 1);

    let reply = common::read_record(&mut client).unwrap();
    assert_eq!(reply.record_type, common::GET_VALUES_RESULT);

    let mut request = batch.pop().unwrap();
    assert!(request.complete(0));
    common::expect_terminal_streams(&mut client, 1);
    common::expect_end_request(&mut client, 1);
}
