//! Input files and driver script for one peptide run.
//!
//! A run is three stages in implicit solvent (GB, `igb=8`): minimization, heating to 300 K and
//! the production run whose total energy ends up in `Analysis/summary_avg.EPTOT`.

use crate::config::{Engine, TemplateVariant};

pub const TLEAP_INPUT: &str = "tlsc";
pub const DRIVER: &str = "ambsc";
pub const MINIMIZE_INPUT: &str = "1in";
pub const HEAT_INPUT: &str = "2in";
pub const PRODUCTION_INPUT: &str = "3in";

pub fn tleap_input(variant: TemplateVariant, names: &str) -> String {
    format!(
        "source {leaprc}
foo = sequence {{ {names} }}
set default pbradii mbondi3
saveamberparm foo prmtop inpcrd
quit
",
        leaprc = variant.leaprc(),
    )
}

pub fn minimize_input() -> &'static str {
    "Minimize
 &cntrl
  imin=1,
  ntx=1,
  maxcyc=2000,
  ncyc=1000,
  ntpr=100,
  igb=8,
  cut=99999.0
 /
"
}

pub fn heat_input() -> &'static str {
    "Heating
 &cntrl
  imin=0,
  ntx=1,
  irest=0,
  nstlim=10000,
  dt=0.002,
  ntf=2,
  ntc=2,
  tempi=0.0,
  temp0=300.0,
  ntpr=100,
  ntwx=100,
  ntb=0,
  ntp=0,
  ntt=3,
  igb=8,
  gamma_ln=2.0,
  nmropt=1,
  ig=-1,
  cut=99999.0
 /
&wt type='TEMP0', istep1=0, istep2=9000, value1=0.0, value2=300.0 /
&wt type='TEMP0', istep1=9001, istep2=10000, value1=300.0, value2=300.0 /
&wt type='END' /
"
}

pub fn production_input(nstlim: u64) -> String {
    format!(
        "Production
 &cntrl
  imin=0,
  ntx=5,
  irest=1,
  nstlim={nstlim},
  dt=0.002,
  ntf=2,
  ntc=2,
  temp0=300.0,
  ntpr=100,
  ntwx=100,
  ntb=0,
  ntp=0,
  ntt=3,
  igb=8,
  gamma_ln=2.0,
  ig=-1,
  cut=99999.0
 /
"
    )
}

/// Driver executed inside the job directory, the engine picks its device from the environment
pub fn driver_script(engine: Engine) -> String {
    format!(
        r#"#!/bin/bash
set -e

runengine(){{
{engine} -O \
	-i 1in -o 1out \
	-p prmtop -c inpcrd \
	-r 1rst -inf 1mdinfo

{engine} -O \
	-i 2in -o 2out \
	-p prmtop -c 1rst \
	-r 2rst -x 2.mdcrd \
	-inf 2mdinfo

{engine} -O \
	-i 3in -o 3out \
	-p prmtop -c 2rst \
	-r 3rst -x 3.mdcrd \
	-inf 3mdinfo
}}

processdat(){{
mkdir -p Analysis
cd Analysis
process_mdout.perl ../3out
cd ..
}}

cleanupfiles(){{
mkdir -p archived
mv 1* 2* tlsc archived
}}

echo "start at: $(date)" >> timelog

runengine
processdat
cleanupfiles

echo "end at: $(date)" >> timelog
"#,
        engine = engine.binary(),
    )
}
