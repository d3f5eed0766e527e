//! SDP helpers for trickle-ICE aggregation.
//!
//! The only SDP manipulation the core performs: folding buffered trickle
//! candidates back into an offer before handing it to a backend that needs
//! a complete SDP.

use crate::types::IceCandidate;

/// Insert buffered candidates into their media sections.
///
/// Sections are matched by `sdpMLineIndex`, falling back to `a=mid:` when
/// only `sdpMid` is present, falling back to the first media section.
/// Candidate lines are normalized to `a=candidate:…`.
pub fn add_candidates(sdp: &str, candidates: &[IceCandidate]) -> String {
    if candidates.is_empty() {
        return sdp.to_string();
    }

    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = sdp.lines().collect();

    // Line index of each m= section start, plus its mid when present.
    let mut sections: Vec<(usize, Option<String>)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("m=") {
            sections.push((i, None));
        } else if let Some(mid) = line.strip_prefix("a=mid:") {
            if let Some(last) = sections.last_mut() {
                last.1 = Some(mid.trim().to_string());
            }
        }
    }

    if sections.is_empty() {
        return sdp.to_string();
    }

    // Collect candidate attribute lines per section index.
    let mut pending: Vec<Vec<String>> = vec![Vec::new(); sections.len()];
    for cand in candidates {
        let idx = section_for(cand, &sections);
        pending[idx].push(attribute_line(&cand.candidate));
    }

    // Rebuild, appending each section's candidates at its end.
    let section_end = |sec: usize| -> usize {
        sections
            .get(sec + 1)
            .map(|(start, _)| *start)
            .unwrap_or(lines.len())
    };

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + candidates.len());
    let mut next_section = 0;
    for (i, line) in lines.iter().enumerate() {
        if next_section < sections.len() && i == section_end(next_section) {
            out.append(&mut pending[next_section]);
            next_section += 1;
        }
        out.push(line.to_string());
    }
    while next_section < sections.len() {
        out.append(&mut pending[next_section]);
        next_section += 1;
    }

    let mut joined = out.join(newline);
    joined.push_str(newline);
    joined
}

fn section_for(cand: &IceCandidate, sections: &[(usize, Option<String>)]) -> usize {
    if let Some(index) = cand.m_index {
        let index = index as usize;
        if index < sections.len() {
            return index;
        }
    }
    if let Some(ref mid) = cand.m_id {
        if let Some(pos) = sections.iter().position(|(_, m)| m.as_deref() == Some(mid)) {
            return pos;
        }
    }
    0
}

fn attribute_line(candidate: &str) -> String {
    let c = candidate.trim();
    if c.starts_with("a=") {
        c.to_string()
    } else if c.starts_with("candidate:") {
        format!("a={c}")
    } else {
        format!("a=candidate:{c}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:1\r\n";

    fn cand(m_index: Option<u32>, m_id: Option<&str>, c: &str) -> IceCandidate {
        IceCandidate {
            m_id: m_id.map(str::to_string),
            m_index,
            candidate: c.to_string(),
        }
    }

    #[test]
    fn candidates_land_in_their_sections() {
        let out = add_candidates(
            OFFER,
            &[
                cand(Some(0), None, "candidate:1 1 UDP 1 10.0.0.1 4444 typ host"),
                cand(Some(1), None, "candidate:2 1 UDP 1 10.0.0.1 5555 typ host"),
            ],
        );
        let audio = out.find("m=audio").unwrap();
        let video = out.find("m=video").unwrap();
        let c1 = out.find("4444").unwrap();
        let c2 = out.find("5555").unwrap();
        assert!(audio < c1 && c1 < video);
        assert!(video < c2);
        assert_eq!(out.matches("a=candidate:").count(), 2);
    }

    #[test]
    fn mid_fallback_is_used_without_index() {
        let out = add_candidates(
            OFFER,
            &[cand(None, Some("1"), "candidate:9 1 UDP 1 10.0.0.2 6666 typ host")],
        );
        let video = out.find("m=video").unwrap();
        assert!(out.find("6666").unwrap() > video);
    }

    #[test]
    fn bare_candidate_strings_are_normalized() {
        let out = add_candidates(OFFER, &[cand(Some(0), None, "3 1 UDP 1 10.0.0.3 7777 typ host")]);
        assert!(out.contains("a=candidate:3 1 UDP"));
    }

    #[test]
    fn empty_candidate_list_is_identity() {
        assert_eq!(add_candidates(OFFER, &[]), OFFER);
    }
}
