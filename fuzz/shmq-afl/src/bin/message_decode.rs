use afl::fuzz;

fn main() {
    fuzz!(|data: &[u8]| {
        // First byte: how many handles arrive alongside the datagram.
        let Some((&handles, bytes)) = data.split_first() else {
            return;
        };
        let handles = vec![(); usize::from(handles % 4)];

        let Ok(message) = shmq_wire::decode(bytes, handles) else {
            return;
        };

        let kind = message.kind();
        let (encoded, handles) = shmq_wire::encode(message);
        assert_eq!(encoded.as_slice(), bytes);
        assert_eq!(encoded.len(), kind.wire_len());
        assert_eq!(handles.len(), kind.handle_count());
    });
}
