/// Captured remote frame: marks and spaces in microseconds, starting with a mark.
///
/// Two 23-entry words sent as A B A B with 34.9 ms gaps between them. The frame
/// ends on a mark; the transmitter closes it by switching the carrier off.
pub const IR_RAW_SEND: &[u16] = &[
    1263, 380, 1252, 459, 1252, 439, 1268, 431,
    385, 1288, 399, 1247, 1280, 436, 380, 1305,
    403, 1268, 436, 1264, 432, 1255, 421, 34924,
    1232, 445, 1264, 455, 1225, 431, 1256, 424,
    419, 1280, 421, 1259, 1251, 437, 405, 1277,
    399, 1283, 404, 1268, 419, 1269, 393, 34924,
    1263, 380, 1252, 459, 1252, 439, 1268, 431,
    385, 1288, 399, 1247, 1280, 436, 380, 1305,
    403, 1268, 436, 1264, 432, 1255, 421, 34924,
    1232, 445, 1264, 455, 1225, 431, 1256, 424,
    419, 1280, 421, 1259, 1251, 437, 405, 1277,
    399, 1283, 404, 1268, 419, 1269, 393,
];
