//! MD5 analyzer: recognizes a procedure that computed MD5 over a tainted
//! input region and produced the digest as output (spec §4.8). Ported
//! from `Prophet/protocol/algorithms/hash_analyzer.cpp`, swapping the
//! original's OpenSSL `MD5()` call for the `md5` crate.

use crate::taint::{Taint, TaintRegion};

pub const MD_SIZE: usize = 16;

/// A contiguous byte region of a procedure's input or output snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub offset: usize,
    pub len: usize,
}

/// One procedure invocation's captured inputs/outputs and their taint, as
/// the engine would record around a `call`/`ret` pair.
pub struct ProcContext {
    pub entry: u32,
    pub inputs: Vec<u8>,
    pub outputs: Vec<u8>,
    pub input_regions: Vec<MemRegion>,
    pub output_regions: Vec<MemRegion>,
    pub input_taint: Vec<Taint>,
}

/// A recognized algorithm invocation: name, description, the procedure
/// entry it was found at, and the regions involved.
#[derive(Debug, Clone)]
pub struct AlgTag {
    pub name: String,
    pub description: String,
    pub proc_entry: u32,
    pub params: Vec<(String, MemRegion, Vec<u8>)>,
}

impl AlgTag {
    fn new(name: &str, description: &str, proc_entry: u32) -> Self {
        AlgTag {
            name: name.to_string(),
            description: description.to_string(),
            proc_entry,
            params: Vec::new(),
        }
    }

    fn add_param(&mut self, name: &str, region: MemRegion, bytes: &[u8]) {
        self.params.push((name.to_string(), region, bytes.to_vec()));
    }
}

/// Result of a successful MD5 recognition: the tag plus the region/bytes
/// of the output digest, which the caller can feed back in as a newly
/// taint-introduced message.
pub struct Md5Recognition {
    pub tag: AlgTag,
    pub output_region: MemRegion,
    pub output_bytes: Vec<u8>,
}

/// Stateless MD5 recognizer: given a procedure context, looks for an
/// input region with taint forming a single contiguous run and an output
/// region of exactly `MD_SIZE` bytes whose content is the MD5 digest of
/// that input.
pub struct Md5Analyzer;

impl Md5Analyzer {
    pub fn on_original_procedure(&self, ctx: &ProcContext) -> Option<Md5Recognition> {
        for (input, input_taint) in ctx.input_regions.iter().zip(&ctx.input_taint) {
            if !input_taint.is_any_tainted() {
                continue;
            }

            let regions = input_taint.generate_regions();
            if regions.len() != 1 {
                continue;
            }

            for output in &ctx.output_regions {
                if output.len != MD_SIZE {
                    continue;
                }

                if let Some(recognition) = self.test_md5(ctx, *input, *output, regions[0]) {
                    return Some(recognition);
                }
            }
        }

        None
    }

    fn test_md5(
        &self,
        ctx: &ProcContext,
        input: MemRegion,
        output: MemRegion,
        _source_region: TaintRegion,
    ) -> Option<Md5Recognition> {
        let in_bytes = &ctx.inputs[input.offset..input.offset + input.len];
        let out_bytes = &ctx.outputs[output.offset..output.offset + output.len];

        let digest = md5::compute(in_bytes);
        if digest.as_ref() != out_bytes {
            return None;
        }

        let mut tag = AlgTag::new("MD5", "Message Digest", ctx.entry);
        tag.add_param("Message", input, in_bytes);
        tag.add_param("Digest", output, out_bytes);

        Some(Md5Recognition {
            tag,
            output_region: output,
            output_bytes: out_bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tainted_run(len: usize) -> Taint {
        let mut t = Taint::new();
        for i in 0..len.min(crate::taint::WIDTH) {
            t.set(i);
        }
        t
    }

    #[test]
    fn recognizes_md5_over_contiguous_tainted_input() {
        let input = b"the quick brown fox".to_vec();
        let digest = md5::compute(&input);

        let ctx = ProcContext {
            entry: 0x401000,
            inputs: input.clone(),
            outputs: digest.to_vec(),
            input_regions: vec![MemRegion { offset: 0, len: input.len() }],
            output_regions: vec![MemRegion { offset: 0, len: MD_SIZE }],
            input_taint: vec![tainted_run(input.len().min(crate::taint::WIDTH))],
        };

        let result = Md5Analyzer.on_original_procedure(&ctx).expect("should recognize MD5");
        assert_eq!(result.tag.name, "MD5");
        assert_eq!(result.tag.proc_entry, 0x401000);
        assert_eq!(result.output_bytes, digest.to_vec());
    }

    #[test]
    fn untainted_input_is_skipped() {
        let input = b"untouched".to_vec();
        let digest = md5::compute(&input);

        let ctx = ProcContext {
            entry: 0x401000,
            inputs: input.clone(),
            outputs: digest.to_vec(),
            input_regions: vec![MemRegion { offset: 0, len: input.len() }],
            output_regions: vec![MemRegion { offset: 0, len: MD_SIZE }],
            input_taint: vec![Taint::new()],
        };

        assert!(Md5Analyzer.on_original_procedure(&ctx).is_none());
    }

    #[test]
    fn mismatched_digest_is_not_recognized() {
        let input = b"the quick brown fox".to_vec();

        let ctx = ProcContext {
            entry: 0x401000,
            inputs: input.clone(),
            outputs: vec![0u8; MD_SIZE],
            input_regions: vec![MemRegion { offset: 0, len: input.len() }],
            output_regions: vec![MemRegion { offset: 0, len: MD_SIZE }],
            input_taint: vec![tainted_run(input.len().min(crate::taint::WIDTH))],
        };

        assert!(Md5Analyzer.on_original_procedure(&ctx).is_none());
    }

    #[test]
    fn non_contiguous_taint_region_disqualifies_input() {
        let input = b"the quick brown fox".to_vec();
        let digest = md5::compute(&input);

        let mut taint = Taint::new();
        taint.set(0);
        taint.set(2);

        let ctx = ProcContext {
            entry: 0x401000,
            inputs: input,
            outputs: digest.to_vec(),
            input_regions: vec![MemRegion { offset: 0, len: 4 }],
            output_regions: vec![MemRegion { offset: 0, len: MD_SIZE }],
            input_taint: vec![taint],
        };

        assert!(Md5Analyzer.on_original_procedure(&ctx).is_none());
    }
}
