use std::time::Duration;

use bytes::Bytes;

use crate::types::ToArgs;

/// A single command under construction.
///
/// Arguments are binary-safe; numbers are formatted on the way in. The
/// builder is consuming so a finished command can be handed to the
/// dispatcher by value:
///
/// ```
/// use rediox::cmd;
/// let c = cmd("SET").arg("key").arg(42);
/// assert_eq!(c.name(), "SET");
/// ```
#[derive(Clone, Debug)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
    no_retry: bool,
    deadline: Option<Duration>,
}

/// Shortcut for [`Cmd::new`].
pub fn cmd(name: &str) -> Cmd {
    Cmd::new(name)
}

impl Cmd {
    /// Starts a new command with the given name.
    pub fn new(name: &str) -> Cmd {
        Cmd {
            args: vec![name.as_bytes().to_vec()],
            no_retry: false,
            deadline: None,
        }
    }

    /// Appends an argument (or several, for collection types).
    pub fn arg<T: ToArgs>(mut self, arg: T) -> Cmd {
        arg.write_args(&mut self.args);
        self
    }

    /// Marks the command as not safe to resubmit after a connection loss,
    /// regardless of the connection's resend policy.
    pub fn no_retry(mut self) -> Cmd {
        self.no_retry = true;
        self
    }

    /// Attaches a caller deadline to this command. Expiry settles the
    /// command with a `Timeout` error; it never retracts a write that
    /// already reached the server.
    pub fn timeout(mut self, deadline: Duration) -> Cmd {
        self.deadline = Some(deadline);
        self
    }

    /// The command name, uppercased.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    pub(crate) fn is_no_retry(&self) -> bool {
        self.no_retry
    }

    pub(crate) fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// All arguments including the command name itself.
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Serializes the command as an array of bulk strings.
    pub fn pack(&self) -> Bytes {
        let mut out = Vec::with_capacity(16 + self.args.iter().map(|a| a.len() + 12).sum::<usize>());
        let mut ibuf = itoa::Buffer::new();
        out.push(b'*');
        out.extend_from_slice(ibuf.format(self.args.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.push(b'$');
            out.extend_from_slice(ibuf.format(arg.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        Bytes::from(out)
    }

    /// True when the command only reads. Such commands are eligible for
    /// replica routing in cluster mode.
    pub fn is_readonly(&self) -> bool {
        matches!(
            self.name().as_str(),
            "GET" | "MGET"
                | "EXISTS"
                | "TTL"
                | "PTTL"
                | "TYPE"
                | "STRLEN"
                | "GETRANGE"
                | "SUBSTR"
                | "EXPIRETIME"
                | "PEXPIRETIME"
                | "HGET"
                | "HGETALL"
                | "HMGET"
                | "HKEYS"
                | "HVALS"
                | "HLEN"
                | "HEXISTS"
                | "HSTRLEN"
                | "HRANDFIELD"
                | "LLEN"
                | "LRANGE"
                | "LINDEX"
                | "LPOS"
                | "SCARD"
                | "SISMEMBER"
                | "SMISMEMBER"
                | "SMEMBERS"
                | "SRANDMEMBER"
                | "SUNION"
                | "SINTER"
                | "SDIFF"
                | "ZCARD"
                | "ZCOUNT"
                | "ZSCORE"
                | "ZMSCORE"
                | "ZRANGE"
                | "ZRANGEBYSCORE"
                | "ZRANGEBYLEX"
                | "ZREVRANGE"
                | "ZREVRANGEBYSCORE"
                | "ZREVRANGEBYLEX"
                | "ZRANK"
                | "ZREVRANK"
                | "ZRANDMEMBER"
                | "ZLEXCOUNT"
                | "XRANGE"
                | "XREVRANGE"
                | "XLEN"
                | "XREAD"
                | "GETBIT"
                | "BITCOUNT"
                | "BITPOS"
                | "BITFIELD_RO"
                | "PFCOUNT"
                | "GEOPOS"
                | "GEODIST"
                | "GEOHASH"
                | "GEOSEARCH"
                | "DUMP"
                | "SORT_RO"
                | "SINTERCARD"
                | "LCS"
        )
    }

    /// Extracts the key arguments used for cluster routing. Commands without
    /// keys return an empty list and route to an arbitrary node.
    pub fn keys(&self) -> Vec<&[u8]> {
        let name = self.name();
        let rest = &self.args[1..];
        match name.as_str() {
            // keyless commands
            "PING" | "HELLO" | "AUTH" | "SELECT" | "ECHO" | "INFO" | "CLUSTER" | "CLIENT"
            | "CONFIG" | "COMMAND" | "ASKING" | "READONLY" | "READWRITE" | "RESET" | "QUIT"
            | "FLUSHALL" | "FLUSHDB" | "DBSIZE" | "SCRIPT" | "WAIT" | "SCAN" | "TIME"
            | "SENTINEL" | "SHUTDOWN" | "REPLICAOF" | "SLAVEOF" | "SWAPDB" | "MULTI" | "EXEC"
            | "DISCARD" | "UNWATCH" | "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE"
            | "PUNSUBSCRIBE" | "PUBLISH" | "RANDOMKEY" | "MEMORY" | "LATENCY" | "SLOWLOG"
            | "FUNCTION" | "ACL" | "LOLWUT" | "DEBUG" => vec![],
            // every argument is a key
            "MGET" | "DEL" | "UNLINK" | "EXISTS" | "WATCH" | "TOUCH" | "SUNION" | "SINTER"
            | "SDIFF" | "PFCOUNT" | "PFMERGE" => rest.iter().map(|a| a.as_slice()).collect(),
            // key/value alternating
            "MSET" | "MSETNX" => rest.iter().step_by(2).map(|a| a.as_slice()).collect(),
            // trailing timeout argument
            "BLPOP" | "BRPOP" => rest
                .iter()
                .take(rest.len().saturating_sub(1))
                .map(|a| a.as_slice())
                .collect(),
            // explicit key count
            "EVAL" | "EVALSHA" | "EVAL_RO" | "EVALSHA_RO" | "FCALL" | "FCALL_RO" => {
                let numkeys = rest
                    .get(1)
                    .and_then(|a| std::str::from_utf8(a).ok())
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(0);
                rest.iter()
                    .skip(2)
                    .take(numkeys)
                    .map(|a| a.as_slice())
                    .collect()
            }
            // keys follow the STREAMS token, one per stream id
            "XREAD" | "XREADGROUP" => {
                let streams = rest
                    .iter()
                    .position(|a| a.eq_ignore_ascii_case(b"STREAMS"));
                match streams {
                    Some(idx) => {
                        let tail = &rest[idx + 1..];
                        tail[..tail.len() / 2]
                            .iter()
                            .map(|a| a.as_slice())
                            .collect()
                    }
                    None => vec![],
                }
            }
            _ => rest.first().map(|a| a.as_slice()).into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_as_bulk_string_array() {
        let packed = cmd("SET").arg("key").arg(42).pack();
        assert_eq!(&packed[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$2\r\n42\r\n");
    }

    #[test]
    fn packs_binary_and_empty_arguments() {
        let packed = cmd("SET").arg(&b"\x00\x01"[..]).arg("").pack();
        assert_eq!(&packed[..], b"*3\r\n$3\r\nSET\r\n$2\r\n\x00\x01\r\n$0\r\n\r\n");
    }

    #[test]
    fn key_extraction() {
        assert_eq!(cmd("GET").arg("k").keys(), vec![b"k" as &[u8]]);
        assert_eq!(cmd("PING").keys(), Vec::<&[u8]>::new());
        assert_eq!(
            cmd("MSET").arg("a").arg("1").arg("b").arg("2").keys(),
            vec![b"a" as &[u8], b"b"]
        );
        assert_eq!(
            cmd("MGET").arg("a").arg("b").keys(),
            vec![b"a" as &[u8], b"b"]
        );
        assert_eq!(
            cmd("EVAL").arg("return 1").arg(2).arg("x").arg("y").arg("extra").keys(),
            vec![b"x" as &[u8], b"y"]
        );
        assert_eq!(
            cmd("XREAD").arg("COUNT").arg(5).arg("STREAMS").arg("s1").arg("s2").arg("0").arg("0").keys(),
            vec![b"s1" as &[u8], b"s2"]
        );
        assert_eq!(
            cmd("BLPOP").arg("q1").arg("q2").arg(0).keys(),
            vec![b"q1" as &[u8], b"q2"]
        );
    }

    #[test]
    fn readonly_flags() {
        assert!(cmd("GET").arg("k").is_readonly());
        assert!(cmd("mget").arg("k").is_readonly());
        assert!(!cmd("SET").arg("k").arg("v").is_readonly());
        assert!(!cmd("DEL").arg("k").is_readonly());
    }
}
