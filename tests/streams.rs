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
    thread,
    time::Duration,
};

mod common;

fn serve() -> (Server, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(listener, 10, 10, 1).unwrap();
    let client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    (server, client)
}

#[test]
fn filter_requests_wait_for_the_data_stream() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve();

    let mut bytes = common::begin_request(1, 3, 1);
    bytes.extend(common::record(common::PARAMS, 1, &common::pair(b"K", b"V")));
    bytes.extend(common::record(common::PARAMS, 1, &[]));
    bytes.extend(common::record(common::STDIN, 1, b"hi"));
    bytes.extend(common::record(common::STDIN, 1, &[]));
    bytes.extend(common::record(common::DATA, 1, b"d"));
    client.write_all(&bytes).unwrap();

    // Stdin has terminated but data has not: no assignment yet.
    common::drive(&mut server);

    client.write_all(&common::record(common::DATA, 1, &[])).unwrap();
    let mut batch = common::poll_requests(&mut server, 10);
    assert_eq!(batch.len(), 1);
    let mut request = batch.pop().unwrap();
    assert_eq!(request.role(), 3);
    assert!(request.keep_conn());
    assert_eq!(request.params()[b"K".as_slice()], b"V".to_vec());
    assert_eq!(request.stdin(), b"hi");
    assert_eq!(request.data(), b"d");

    assert!(request.write_stdout(b"hi"));
    assert!(request.write_stderr(b"d"));
    assert!(request.complete(0));

    let stdout = common::read_record(&mut client).unwrap();
    assert_eq!(stdout.record_type, common::STDOUT);
    assert_eq!(stdout.content, b"hi");
    let stderr = common::read_record(&mut client).unwrap();
    assert_eq!(stderr.record_type, common::STDERR);
    assert_eq!(stderr.content, b"d");
    common::expect_terminal_streams(&mut client, 1);
    let (app_status, protocol_status) = common::expect_end_request(&mut client, 1);
    assert_eq!(app_status, 0);
    assert_eq!(protocol_status, common::REQUEST_COMPLETE);

    // The connection remains open for the next request.
    let mut bytes = common::begin_request(2, 1, 1);
    bytes.extend(common::record(common::PARAMS, 2, &[]));
    bytes.extend(common::record(common::STDIN, 2, &[]));
    client.write_all(&bytes).unwrap();
    assert_eq!(common::poll_requests(&mut server, 10).len(), 1);
}

#[test]
fn authorizer_requests_need_only_params() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve();

    let mut bytes = common::begin_request(1, 2, 1);
    bytes.extend(common::record(common::PARAMS, 1, &common::pair(b"USER", b"u")));
    bytes.extend(common::record(common::PARAMS, 1, &[]));
    client.write_all(&bytes).unwrap();

    let mut batch = common::poll_requests(&mut server, 10);
    assert_eq!(batch.len(), 1);
    let mut request = batch.pop().unwrap();
    assert_eq!(request.role(), 2);
    assert!(request.stdin().is_empty());
    assert!(request.complete(0));
}

#[test]
fn large_writes_are_partitioned_into_legal_records() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve();

    let mut bytes = common::begin_request(1, 1, 1);
    bytes.extend(common::record(common::PARAMS, 1, &[]));
    bytes.extend(common::record(common::STDIN, 1, &[]));
    client.write_all(&bytes).unwrap();

    let mut batch = common::poll_requests(&mut server, 10);
    assert_eq!(batch.len(), 1);
    let mut request = batch.pop().unwrap();

    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    // The write fills the socket buffer well past its capacity; a
    // reader thread keeps it draining.
    let writer = thread::spawn(move || {
        assert!(request.write_stdout(&payload));
        assert!(request.complete(0));
    });

    let mut stdout = Vec::new();
    loop {
        let record = common::read_record(&mut client).unwrap();
        assert_eq!(record.request_id, 1);
        assert!(record.content.len() <= 0xffff);
        assert_eq!(record.wire_len() % 8, 0);
        match record.record_type {
            common::STDOUT if record.content.is_empty() => {}
            common::STDOUT => stdout.extend_from_slice(&record.content),
            common::STDERR => assert!(record.content.is_empty()),
            common::END_REQUEST => break,
            other => panic!("unexpected record type {other}"),
        }
    }
    writer.join().unwrap();
    assert_eq!(stdout, expected);
}

#[test]
fn large_stdin_streams_reassemble_exactly() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve();

    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 241) as u8).collect();
    let expected = payload.clone();

    let writer = thread::spawn(move || {
        client.write_all(&common::begin_request(1, 1, 1)).unwrap();
        client.write_all(&common::record(common::PARAMS, 1, &[])).unwrap();
        for chunk in payload.chunks(0xffff) {
            client
                .write_all(&common::record(common::STDIN, 1, chunk))
                .unwrap();
        }
        client.write_all(&common::record(common::STDIN, 1, &[])).unwrap();
        client
    });

    let mut batch = common::poll_requests(&mut server, 50);
    assert_eq!(batch.len(), 1);
    let mut request = batch.pop().unwrap();
    assert_eq!(request.stdin(), expected);
    request.complete(0);
    writer.join().unwrap();
}

#[test]
fn records_of_concurrent_handles_never_interleave() {
    common::setup();
    let _guard = common::interface_guard();
    let (mut server, mut client) = serve();

    let mut bytes = Vec::new();
    for id in [1u16, 2u16] {
        bytes.extend(common::begin_request(id, 1, 1));
        bytes.extend(common::record(common::PARAMS, id, &[]));
        bytes.extend(common::record(common::STDIN, id, &[]));
    }
    client.write_all(&bytes).unwrap();

    let mut batch = common::poll_requests(&mut server, 10);
    if batch.len() < 2 {
        batch.extend(common::poll_requests(&mut server, 10));
    }
    assert_eq!(batch.len(), 2);

    // Each handle floods its own stdout from its own thread; the
    // per-connection write mutex must keep every record intact.
    let workers: Vec<_> = batch
        .into_iter()
        .map(|mut request| {
            thread::spawn(move || {
                let marker = request.fcgi_id() as u8;
                let chunk = vec![marker; 4096];
                for _ in 0..64 {
                    assert!(request.write_stdout(&chunk));
                }
                assert!(request.complete(0));
            })
        })
        .collect();

    let mut totals = [0usize; 3];
    let mut ended = 0;
    while ended < 2 {
        let record = common::read_record(&mut client).unwrap();
        match record.record_type {
            common::STDOUT => {
                let id = record.request_id;
                assert!(id == 1 || id == 2);
                // Record granularity: every byte of a record belongs
                // to the stream of the id in its header.
                assert!(record.content.iter().all(|b| *b == id as u8));
                totals[id as usize] += record.content.len();
            }
            common::STDERR => assert!(record.content.is_empty()),
            common::END_REQUEST => ended += 1,
            other => panic!("unexpected record type {other}"),
        }
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(totals[1], 64 * 4096);
    assert_eq!(totals[2], 64 * 4096);
}
