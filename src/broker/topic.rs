//! Wildcard topic matching
//!
//! Topics and expressions are dot-segmented. In an expression `*` stands for
//! exactly one segment and `>` for everything that follows, including
//! nothing: `A.B.>` matches `A.B` as well as `A.B.C.D`.

/// Returns whether `topic` is matched by the subscription `expression`.
pub fn is_topic_match(topic: &str, expression: &str) -> bool {
    let topic = topic.as_bytes();
    let expression = expression.as_bytes();
    let (mut t, mut e) = (0, 0);

    loop {
        if e < expression.len() && expression[e] == b'>' {
            return true;
        }
        if t == topic.len() || e == expression.len() {
            break;
        }
        if expression[e] == b'*' {
            // consume one segment, which must not be empty
            let start = t;
            while t < topic.len() && topic[t] != b'.' {
                t += 1;
            }
            if t == start {
                return false;
            }
            e += 1;
            continue;
        }
        if topic[t] != expression[e] {
            return false;
        }
        t += 1;
        e += 1;
    }

    if t < topic.len() {
        return false;
    }
    matches!(&expression[e..], b"" | b">" | b".>")
}
